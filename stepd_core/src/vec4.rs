// src/vec4.rs - 4-dimensional f64 vector (x, y, z, e)

use std::ops::{Add, Index, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Immutable 4d vector over the printer axes (x, y, z, e).
///
/// Values are `Copy` and every derived quantity is recomputed on demand;
/// the operations involved are a handful of floating-point ops each.
/// Serialized as a plain 4-element array.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Vec4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

impl Vec4 {
    pub const ZERO: Vec4 = Vec4 { x: 0.0, y: 0.0, z: 0.0, e: 0.0 };

    pub const fn new(x: f64, y: f64, z: f64, e: f64) -> Self {
        Self { x, y, z, e }
    }

    /// Scale by the multiplicative inverse of `s`.
    pub fn div(self, s: f64) -> Self {
        self * (1.0 / s)
    }

    /// Per-dimension product.
    pub fn mul_v(self, o: Vec4) -> Self {
        Vec4::new(self.x * o.x, self.y * o.y, self.z * o.z, self.e * o.e)
    }

    /// Per-dimension multiplicative inverse.
    pub fn inv(self) -> Self {
        Vec4::new(1.0 / self.x, 1.0 / self.y, 1.0 / self.z, 1.0 / self.e)
    }

    pub fn abs(self) -> Self {
        Vec4::new(self.x.abs(), self.y.abs(), self.z.abs(), self.e.abs())
    }

    pub fn dot(self, o: Vec4) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z + self.e * o.e
    }

    /// L2 magnitude.
    pub fn dist(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// L2-normalized vector; the zero vector normalizes to itself.
    pub fn norm(self) -> Self {
        match self.dist() {
            0.0 => Vec4::ZERO,
            1.0 => self,
            d => self.div(d),
        }
    }

    /// True if every |component| of `self` is within the |component|
    /// bounds of `o`.
    pub fn within(self, o: Vec4) -> bool {
        let a = self.abs();
        let b = o.abs();
        a.x <= b.x && a.y <= b.y && a.z <= b.z && a.e <= b.e
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.x, self.y, self.z, self.e]
    }

    /// The (x, y) plane components.
    pub fn xy(self) -> (f64, f64) {
        (self.x, self.y)
    }
}

impl From<[f64; 4]> for Vec4 {
    fn from(v: [f64; 4]) -> Self {
        Vec4::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Vec4> for [f64; 4] {
    fn from(v: Vec4) -> Self {
        v.to_array()
    }
}

impl Index<usize> for Vec4 {
    type Output = f64;

    fn index(&self, d: usize) -> &f64 {
        match d {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            3 => &self.e,
            _ => panic!("Vec4 index out of range: {d}"),
        }
    }
}

impl Add for Vec4 {
    type Output = Vec4;

    fn add(self, o: Vec4) -> Vec4 {
        Vec4::new(self.x + o.x, self.y + o.y, self.z + o.z, self.e + o.e)
    }
}

impl Sub for Vec4 {
    type Output = Vec4;

    fn sub(self, o: Vec4) -> Vec4 {
        self + -o
    }
}

impl Mul<f64> for Vec4 {
    type Output = Vec4;

    fn mul(self, s: f64) -> Vec4 {
        Vec4::new(self.x * s, self.y * s, self.z * s, self.e * s)
    }
}

impl Neg for Vec4 {
    type Output = Vec4;

    fn neg(self) -> Vec4 {
        self * -1.0
    }
}

impl std::fmt::Display for Vec4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} {} {} {}]", self.x, self.y, self.z, self.e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algebra() {
        let mut r = Vec4::new(1.0, 0.0, 2.0, 0.0);
        r = r + Vec4::new(0.0, 1.0, 0.0, 2.0);
        assert_eq!(r, Vec4::new(1.0, 1.0, 2.0, 2.0));
        assert_eq!(r, (-r).abs().abs());

        r = r - Vec4::new(1.0, 1.0, 2.0, 0.0);
        assert_eq!(r, Vec4::new(0.0, 0.0, 0.0, 2.0));
        assert_eq!(r.dist(), 2.0);
        assert_eq!(r.norm(), Vec4::new(0.0, 0.0, 0.0, 1.0));

        r = r.div(2.0);
        assert_eq!(r.dot(r), 1.0);
        assert_eq!(r.dist(), 1.0);
        assert_eq!(r.to_array(), [0.0, 0.0, 0.0, 1.0]);

        let zero = r - r;
        assert_eq!(zero.dist(), 0.0);
        assert_eq!(zero.norm(), Vec4::ZERO);
    }

    #[test]
    fn add_neg_cancels() {
        let v = Vec4::new(3.5, -1.25, 0.75, 2.0);
        assert_eq!((v + -v).dist(), 0.0);
        assert_eq!(v.dot(v), v.dist() * v.dist());
    }

    #[test]
    fn norm_is_unit_or_zero() {
        for v in [Vec4::new(3.0, 4.0, 0.0, 0.0), Vec4::ZERO, Vec4::new(0.1, 0.1, 0.1, 0.1)] {
            let d = v.norm().dist();
            assert!(d == 0.0 || (d - 1.0).abs() < 1e-12, "bad norm dist {d}");
        }
    }

    #[test]
    fn within_bounds() {
        let v = Vec4::new(1.0, -2.0, 0.5, 0.0);
        assert!(v.within(Vec4::new(1.0, 2.0, 1.0, 1.0)));
        assert!(!v.within(Vec4::new(0.5, 2.0, 1.0, 1.0)));
    }

    #[test]
    fn randomized_identities() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let v = Vec4::new(
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
            );
            assert!((v.dot(v) - v.dist() * v.dist()).abs() < 1e-9);
            assert_eq!(v.abs().abs(), v.abs());
            let d = v.norm().dist();
            assert!(d == 0.0 || (d - 1.0).abs() < 1e-12);
            assert!((v + -v).dist() == 0.0);
        }
    }

    #[test]
    fn json_roundtrip() {
        let v = Vec4::new(0.12345, 1.0, -2.5, 4.0);
        let js = serde_json::to_string(&v).unwrap();
        assert_eq!(js, "[0.12345,1.0,-2.5,4.0]");
        let back: Vec4 = serde_json::from_str(&js).unwrap();
        assert_eq!(back, v);
    }
}
