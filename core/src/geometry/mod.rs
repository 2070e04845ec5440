use nalgebra as na;
use std::f64::consts::{PI, TAU};

pub type Vector3 = na::Vector3<f64>;
pub type Rotation3 = na::Rotation3<f64>;

/// Lengths below this are treated as zero when a direction has to be read off a vector.
pub const DEGENERATE_LENGTH: f64 = 1e-12;

/// Wrap an angle into (-pi, pi].
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % TAU;
    if a > PI {
        a -= TAU;
    } else if a <= -PI {
        a += TAU;
    }
    a
}

/// The world axis least aligned with the unit vector `n`.
///
/// The choice jumps where two components of `n` tie in magnitude, so callers
/// that differentiate a basis pick the helper once and keep it.
pub fn least_aligned_axis(n: &Vector3) -> Vector3 {
    let (ax, ay, az) = (n.x.abs(), n.y.abs(), n.z.abs());
    if ax <= ay && ax <= az {
        Vector3::x()
    } else if ay <= az {
        Vector3::y()
    } else {
        Vector3::z()
    }
}

/// Two unit vectors spanning the plane orthogonal to the unit vector `n`,
/// built from `helper`. Smooth in `n` while `helper` is held fixed and not
/// parallel to `n`.
pub fn orthonormal_basis(n: &Vector3, helper: &Vector3) -> (Vector3, Vector3) {
    let t1 = n.cross(helper).normalize();
    let t2 = n.cross(&t1);
    (t1, t2)
}

/// Rotation encoded as axis * angle.
pub fn rotation_from_vector(w: &Vector3) -> Rotation3 {
    Rotation3::new(*w)
}
