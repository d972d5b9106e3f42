// src/physics/shape.rs - time-parameterised velocity envelopes

/// A scalar profile over `[0, dt]` with closed-form time integrals.
///
/// `int1_at`/`int2_at`/`int3_at` take the constants of integration for each
/// order; a trapezoid dispatches piecewise to whichever segment `t` falls
/// in, accumulating the boundary values as it crosses segments.
#[derive(Debug, Clone)]
pub enum Shape {
    Pulse(Pulse),
    Trapezoid(Box<Trapezoid>),
}

impl Shape {
    pub fn area(&self) -> f64 {
        match self {
            Shape::Pulse(p) => p.area,
            Shape::Trapezoid(t) => t.area,
        }
    }

    pub fn dt(&self) -> f64 {
        match self {
            Shape::Pulse(p) => p.dt,
            Shape::Trapezoid(t) => t.dt,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Shape::Pulse(p) => p.is_valid(),
            Shape::Trapezoid(t) => t.is_valid(),
        }
    }

    pub fn apply(&self, t: f64) -> f64 {
        match self {
            Shape::Pulse(p) => p.apply(t),
            Shape::Trapezoid(tr) => tr.apply(t),
        }
    }

    pub fn int1_at(&self, t: f64, c0: f64) -> f64 {
        match self {
            Shape::Pulse(p) => p.int1_at(t, c0),
            Shape::Trapezoid(tr) => tr.int1_at(t, c0),
        }
    }

    pub fn int2_at(&self, t: f64, c0: f64, c1: f64) -> f64 {
        match self {
            Shape::Pulse(p) => p.int2_at(t, c0, c1),
            Shape::Trapezoid(tr) => tr.int2_at(t, c0, c1),
        }
    }

    pub fn int3_at(&self, t: f64, c0: f64, c1: f64, c2: f64) -> f64 {
        match self {
            Shape::Pulse(p) => p.int3_at(t, c0, c1, c2),
            Shape::Trapezoid(_) => {
                unreachable!("third integral is not taken on a composite shape")
            }
        }
    }

    /// Definite first integral over the whole shape.
    pub fn int1(&self, c0: f64) -> f64 {
        self.area() + c0
    }

    /// Definite second integral over the whole shape.
    pub fn int2(&self, c0: f64, c1: f64) -> f64 {
        self.int2_at(self.dt(), c0, c1)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shape::Pulse(p) => write!(f, "Pulse({}, {})", p.dy, p.area),
            Shape::Trapezoid(t) => {
                write!(f, "Trapezoid({}, {}, {}, {})", t.head, t.tail, t.area, t.c)
            }
        }
    }
}

/// Constant value `dy` held long enough to sweep `area`.
#[derive(Debug, Clone, Copy)]
pub struct Pulse {
    area: f64,
    dy: f64,
    dt: f64,
}

impl Pulse {
    fn new(dy: f64, area: f64) -> Pulse {
        let dt = if dy != 0.0 { area / dy } else { 0.0 };
        Pulse { area, dy, dt }
    }

    pub fn is_valid(&self) -> bool {
        self.dt >= 0.0
    }

    pub fn apply(&self, _t: f64) -> f64 {
        self.dy
    }

    pub fn int1_at(&self, t: f64, c0: f64) -> f64 {
        c0 + self.dy * t
    }

    pub fn int2_at(&self, t: f64, c0: f64, c1: f64) -> f64 {
        c0 + c1 * t + self.dy * t * t / 2.0
    }

    pub fn int3_at(&self, t: f64, c0: f64, c1: f64, c2: f64) -> f64 {
        c0 + c1 * t + c2 * t * t / 2.0 + self.dy * t * t * t / 6.0
    }
}

/// A rectangular pulse shape. A zero `dy` yields a zero-length pulse.
pub fn pulse(dy: f64, area: f64) -> Shape {
    Shape::Pulse(Pulse::new(dy, area))
}

/// Head ramp, cruise pulse, tail ramp. The sub-shapes are one integral
/// order down from the trapezoid itself: the trapezoid's value at `t` is
/// the first integral of its head/tail.
#[derive(Debug, Clone)]
pub struct Trapezoid {
    head: Shape,
    middle: Pulse,
    tail: Shape,
    area: f64,
    c: f64,
    dt: f64,
    dt_tail: f64,
}

impl Trapezoid {
    /// Build from the head/tail ramps, total `area`, and entry value `c`.
    /// The middle pulse cruises at the head's exit value and absorbs
    /// whatever area the ramps leave over; a negative remainder marks the
    /// shape invalid.
    pub fn new(head: Shape, tail: Shape, area: f64, c: f64) -> Shape {
        let head_area = head.int2(0.0, c);
        let tail_area = tail.int2(0.0, head.int1(c));
        let middle = Pulse::new(head.int1(c), area - head_area - tail_area);
        let dt_tail = head.dt() + middle.dt;
        let dt = dt_tail + tail.dt();

        Shape::Trapezoid(Box::new(Trapezoid { head, middle, tail, area, c, dt, dt_tail }))
    }

    pub fn is_valid(&self) -> bool {
        self.head.is_valid() && self.middle.is_valid() && self.tail.is_valid()
    }

    pub fn apply(&self, t: f64) -> f64 {
        if t > self.dt_tail {
            self.tail.int1_at(t - self.dt_tail, self.apply(self.dt_tail))
        } else if t > self.head.dt() {
            self.apply(self.head.dt())
        } else {
            self.head.int1_at(t, self.c)
        }
    }

    pub fn int1_at(&self, t: f64, c0: f64) -> f64 {
        let head_dt = self.head.dt();
        if t > self.dt_tail {
            self.tail.int2_at(
                t - self.dt_tail,
                self.int1_at(self.dt_tail, c0),
                self.apply(self.dt_tail),
            )
        } else if t > head_dt {
            self.middle.int1_at(t - head_dt, self.int1_at(head_dt, c0))
        } else {
            self.head.int2_at(t, c0, self.c)
        }
    }

    pub fn int2_at(&self, t: f64, c0: f64, c1: f64) -> f64 {
        let head_dt = self.head.dt();
        if t > self.dt_tail {
            self.tail.int3_at(
                t - self.dt_tail,
                self.int2_at(self.dt_tail, c0, c1),
                self.int1_at(self.dt_tail, c1),
                self.apply(self.dt_tail),
            )
        } else if t > head_dt {
            self.middle.int2_at(
                t - head_dt,
                self.int2_at(head_dt, c0, c1),
                self.int1_at(head_dt, c1),
            )
        } else {
            self.head.int3_at(t, c0, c1, self.c)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pulse_integrates_to_area() {
        let p = pulse(1000.0, 10.0);
        assert!(p.is_valid());
        assert_eq!(p.dt(), 0.01);
        assert_eq!(p.int1_at(p.dt(), 0.0), p.area());
        assert_eq!(p.apply(0.005), 1000.0);
    }

    #[test]
    fn zero_pulse_is_instant() {
        let p = pulse(0.0, 0.0);
        assert!(p.is_valid());
        assert_eq!(p.dt(), 0.0);
    }

    #[test]
    fn negative_duration_is_invalid() {
        // decelerating below the entry value with positive area
        assert!(!pulse(-100.0, 5.0).is_valid());
    }

    #[test]
    fn trapezoid_integrates_to_area() {
        // accelerate 0 -> 10 mm/s at 1000 mm/s^2, cruise, decelerate to 0,
        // sweeping 10 mm total
        let t = Trapezoid::new(pulse(1000.0, 10.0), pulse(-1000.0, -10.0), 10.0, 0.0);
        assert!(t.is_valid());
        assert_eq!(t.apply(0.0), 0.0);
        assert!((t.apply(t.dt()) - 0.0).abs() < 1e-9);
        assert!((t.apply(t.dt() / 2.0) - 10.0).abs() < 1e-9);
        assert!((t.int1_at(t.dt(), 0.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn trapezoid_with_entry_value() {
        // enter at 5 mm/s, cruise at 10, exit at 2
        let t = Trapezoid::new(pulse(1000.0, 5.0), pulse(-1000.0, -8.0), 10.0, 5.0);
        assert!(t.is_valid());
        assert_eq!(t.apply(0.0), 5.0);
        assert!((t.apply(t.dt()) - 2.0).abs() < 1e-9);
        assert!((t.int1_at(t.dt(), 0.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn too_short_trapezoid_is_invalid() {
        // ramps need 0.1 mm but the whole shape only spans 0.05 mm
        let t = Trapezoid::new(pulse(1000.0, 10.0), pulse(-1000.0, -10.0), 0.05, 0.0);
        assert!(!t.is_valid());
    }

    #[test]
    fn s_curve_nesting_integrates() {
        // jerk-limited ramp 0 -> 10 mm/s wrapped as the head of a larger
        // velocity trapezoid
        let pre = Trapezoid::new(pulse(200000.0, 1000.0), pulse(-200000.0, -1000.0), 10.0, 0.0);
        let post = Trapezoid::new(pulse(-200000.0, -1000.0), pulse(200000.0, 1000.0), -10.0, 0.0);
        assert!(pre.is_valid() && post.is_valid());
        let outer = Trapezoid::new(pre, post, 20.0, 0.0);
        assert!(outer.is_valid());
        assert_eq!(outer.apply(0.0), 0.0);
        assert!((outer.apply(outer.dt())).abs() < 1e-9);
        assert!((outer.int1_at(outer.dt(), 0.0) - 20.0).abs() < 1e-6);
    }
}
