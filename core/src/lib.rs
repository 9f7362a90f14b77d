//! Sensor-fusion toolbox for single-object tracking filters
//!
//! This crate provides a state estimator that fuses asynchronous, heterogeneous
//! noisy measurements from a lidar (Cartesian position) and a radar (polar
//! range, bearing, and range rate) into a continuously updated estimate of a
//! moving object's planar position, heading, speed, and turn rate. The
//! estimator is an Unscented Kalman Filter (UKF) built on the Constant Turn
//! Rate and Velocity (CTRV) motion model. The crate does not talk to sensor
//! hardware; measurements are assumed to be pre-extracted detections of a
//! single object, delivered in non-decreasing timestamp order.
//!
//! This crate is primarily built off of two additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for synthetic measurement scenarios.
//!
//! All other functionality is built on top of these crates or is auxiliary
//! functionality (e.g. I/O). The primary reference texts are _Estimation with
//! Applications to Tracking and Navigation_ by Bar-Shalom, Li, and Kirubarajan
//! and the unscented transform papers of Julier and Uhlmann. Variables are
//! generally named for the quantity they represent rather than the symbol used
//! in the literature: the state covariance is `covariance`, not `P`. This
//! style is sometimes relaxed within the body of a given function, but the
//! general rule is to use descriptive names.
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [kalman]: Contains the unscented Kalman filter, its noise configuration, and the per-sensor update steps.
//! - [linalg]: Contains linear algebra utilities and helper functions.
//! - [measurements]: Contains measurement models and the tagged measurement type delivered to the filter.
//! - [sim]: Contains measurement-log I/O, scoring utilities, and synthetic scenario generation.
//!
//! ## The CTRV motion model
//!
//! The five-element CTRV state vector is
//!
//! $$
//! x = [p_x, p_y, v, \psi, \dot{\psi}]
//! $$
//!
//! Where:
//! - $p_x$ and $p_y$ are the planar position in meters,
//! - $v$ is the scalar speed in m/s along the heading,
//! - $\psi$ is the heading in radians,
//! - $\dot{\psi}$ is the turn rate in rad/s.
//!
//! CTRV assumes speed and turn rate are constant between updates, which traces
//! a circular arc:
//!
//! $$
//! \begin{aligned}
//! p_x(+) &= p_x(-) + \frac{v}{\dot{\psi}}\left(\sin(\psi + \dot{\psi} t) - \sin\psi\right) \\\\
//! p_y(+) &= p_y(-) + \frac{v}{\dot{\psi}}\left(\cos\psi - \cos(\psi + \dot{\psi} t)\right) \\\\
//! \psi(+) &= \psi(-) + \dot{\psi} t
//! \end{aligned}
//! $$
//!
//! As the turn rate approaches zero the arc degenerates into a straight line
//! and the closed form above divides by zero, so below a small threshold the
//! propagation switches to $p_x(+) = p_x(-) + v t \cos\psi$ (and likewise for
//! $p_y$). Process noise enters as a longitudinal acceleration $\nu_a$ and a
//! yaw acceleration $\nu_{\ddot{\psi}}$, both zero-mean, integrated over the
//! time step and applied along the current heading.
//!
//! Heading is an angle. Whenever two headings (or bearings) are differenced
//! anywhere in this crate the result is wrapped into $(-\pi, \pi]$ with
//! [wrap_to_pi] before use; linear averaging of raw angle differences near the
//! $\pm\pi$ boundary is invalid otherwise. The propagated heading itself is
//! left unwrapped, only differences are wrapped.
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod sim;

use std::error::Error;
use std::fmt::{self, Debug, Display};

use nalgebra::DVector;

/// Turn rates with an absolute value at or below this threshold (rad/s) are
/// propagated with the straight-line form of the CTRV equations.
pub const TURN_RATE_EPSILON: f64 = 1e-3;
/// Lower clamp (meters) applied to the radar range before it is used as a
/// divisor in the range-rate model.
pub const RANGE_EPSILON: f64 = 1e-6;
/// Raw coordinates closer to zero than this (meters) are clamped at
/// initialization to keep downstream polar conversions away from the origin.
pub const COORDINATE_EPSILON: f64 = 1e-3;
/// Elapsed times at or below this threshold (seconds) skip the prediction
/// step; the two measurements are treated as effectively simultaneous.
pub const MIN_PREDICTION_DT: f64 = 1e-3;

/// Errors surfaced by the fusion filter.
///
/// Near-zero denominators (turn rate, radar range) are *not* errors; they are
/// expected edge cases handled by branch selection and clamping. Everything
/// listed here leaves the filter state untouched: a `process_measurement` call
/// either fully updates the state or fails atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// The measurement contained non-finite values and was rejected before
    /// reaching the math.
    InvalidMeasurement(String),
    /// The measurement timestamp precedes the previously processed one.
    /// Measurements must arrive in non-decreasing timestamp order.
    NonMonotonicTimestamp {
        previous_micros: i64,
        current_micros: i64,
    },
    /// The (augmented) state covariance lost positive definiteness and its
    /// Cholesky factorization failed. This indicates corrupted filter state
    /// and is fatal for the current filter instance.
    CovarianceNotPositiveDefinite,
    /// The innovation covariance was singular and the Kalman gain could not
    /// be computed.
    SingularInnovationCovariance,
}

impl Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::InvalidMeasurement(reason) => {
                write!(f, "invalid measurement: {}", reason)
            }
            FilterError::NonMonotonicTimestamp {
                previous_micros,
                current_micros,
            } => write!(
                f,
                "non-monotonic timestamp: {} us arrived after {} us",
                current_micros, previous_micros
            ),
            FilterError::CovarianceNotPositiveDefinite => {
                write!(f, "state covariance is not positive definite")
            }
            FilterError::SingularInnovationCovariance => {
                write!(f, "innovation covariance is singular")
            }
        }
    }
}

impl Error for FilterError {}

/// Basic structure for holding the CTRV tracking state in the form of planar
/// position, speed, heading, and turn rate. Angles are stored in radians.
#[derive(Clone, Copy, Default, PartialEq)]
pub struct CtrvState {
    /// Position along the x axis in meters
    pub position_x: f64,
    /// Position along the y axis in meters
    pub position_y: f64,
    /// Scalar speed in m/s along the heading
    pub speed: f64,
    /// Heading in radians, counterclockwise from the x axis
    pub heading: f64,
    /// Turn rate in rad/s
    pub turn_rate: f64,
}

impl Debug for CtrvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CtrvState")
            .field("position_x (m)", &self.position_x)
            .field("position_y (m)", &self.position_y)
            .field("speed (m/s)", &self.speed)
            .field("heading (deg)", &self.heading.to_degrees())
            .field("turn_rate (deg/s)", &self.turn_rate.to_degrees())
            .finish()
    }
}

impl Display for CtrvState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CtrvState {{ p: [{:.3}, {:.3}] m, v: {:.3} m/s, heading: {:.2} deg, turn rate: {:.2} deg/s }}",
            self.position_x,
            self.position_y,
            self.speed,
            self.heading.to_degrees(),
            self.turn_rate.to_degrees()
        )
    }
}

impl CtrvState {
    /// Velocity resolved onto the Cartesian axes: `(v cos psi, v sin psi)`.
    pub fn velocity(&self) -> (f64, f64) {
        (
            self.speed * self.heading.cos(),
            self.speed * self.heading.sin(),
        )
    }
}

impl From<CtrvState> for Vec<f64> {
    /// Converts a CtrvState to a Vec<f64> in `[px, py, v, psi, psi_dot]` order.
    fn from(state: CtrvState) -> Self {
        vec![
            state.position_x,
            state.position_y,
            state.speed,
            state.heading,
            state.turn_rate,
        ]
    }
}

impl From<CtrvState> for DVector<f64> {
    /// Converts a CtrvState to a DVector<f64> in `[px, py, v, psi, psi_dot]` order.
    fn from(state: CtrvState) -> Self {
        DVector::from_vec(state.into())
    }
}

impl TryFrom<&[f64]> for CtrvState {
    type Error = &'static str;
    /// Attempts to create a CtrvState from a slice of 5 elements.
    fn try_from(slice: &[f64]) -> Result<Self, Self::Error> {
        if slice.len() != 5 {
            return Err("Slice must have length 5 for CtrvState");
        }
        Ok(CtrvState {
            position_x: slice[0],
            position_y: slice[1],
            speed: slice[2],
            heading: slice[3],
            turn_rate: slice[4],
        })
    }
}

impl TryFrom<Vec<f64>> for CtrvState {
    type Error = &'static str;
    /// Attempts to create a CtrvState from a Vec<f64> of length 5.
    fn try_from(vec: Vec<f64>) -> Result<Self, Self::Error> {
        Self::try_from(vec.as_slice())
    }
}

/// Zero-mean process-noise sample driving one CTRV propagation.
///
/// The CTRV model has no control input; what plays that role is the pair of
/// noise accelerations the unscented transform draws from the augmented state.
/// A deterministic propagation uses [ProcessNoise::default].
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessNoise {
    /// Longitudinal acceleration in m/s^2, applied along the heading
    pub longitudinal_accel: f64,
    /// Yaw (angular) acceleration in rad/s^2
    pub yaw_accel: f64,
}

impl Display for ProcessNoise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProcessNoise {{ nu_a: {:.4} m/s^2, nu_yawdd: {:.4} rad/s^2 }}",
            self.longitudinal_accel, self.yaw_accel
        )
    }
}

/// CTRV forward propagation. Advances a state by `dt` seconds along a
/// constant-speed, constant-turn-rate arc and injects the given process-noise
/// accelerations.
///
/// Turn rates within [TURN_RATE_EPSILON] of zero take the straight-line
/// branch. The propagated heading is intentionally left unwrapped.
///
/// # Arguments
/// * `state` - The CTRV state to propagate in place.
/// * `noise` - The process-noise accelerations for this step.
/// * `dt` - A f64 representing the time step in seconds.
///
/// # Example
/// ```rust
/// use fusetrack::{CtrvState, ProcessNoise, ctrv_forward};
/// let mut state = CtrvState { speed: 2.0, ..Default::default() };
/// ctrv_forward(&mut state, ProcessNoise::default(), 0.5);
/// assert!((state.position_x - 1.0).abs() < 1e-12);
/// ```
pub fn ctrv_forward(state: &mut CtrvState, noise: ProcessNoise, dt: f64) {
    let CtrvState {
        position_x,
        position_y,
        speed,
        heading,
        turn_rate,
    } = *state;
    let (sin_heading, cos_heading) = heading.sin_cos();
    let heading_advance = turn_rate * dt;
    if turn_rate.abs() > TURN_RATE_EPSILON {
        let radius = speed / turn_rate;
        state.position_x = position_x + radius * ((heading + heading_advance).sin() - sin_heading);
        state.position_y = position_y + radius * (cos_heading - (heading + heading_advance).cos());
    } else {
        state.position_x = position_x + speed * dt * cos_heading;
        state.position_y = position_y + speed * dt * sin_heading;
    }
    state.heading = heading + heading_advance;
    // speed and turn rate are constant under CTRV; only noise perturbs them
    let dt_squared = dt * dt;
    state.position_x += 0.5 * noise.longitudinal_accel * dt_squared * cos_heading;
    state.position_y += 0.5 * noise.longitudinal_accel * dt_squared * sin_heading;
    state.speed = speed + noise.longitudinal_accel * dt;
    state.heading += 0.5 * noise.yaw_accel * dt_squared;
    state.turn_rate = turn_rate + noise.yaw_accel * dt;
}

// --- Miscellaneous functions for wrapping and clamping ---

/// Wrap an angle in radians into the half-open interval $(-\pi, \pi]$.
///
/// The wrap is idempotent under whole turns: `wrap_to_pi(angle + 2 * PI * k)`
/// equals `wrap_to_pi(angle)` for any integer `k`, including at the
/// $\pm\pi$ boundary (where the result is $+\pi$).
///
/// # Arguments
/// * `angle` - The angle to be wrapped, in radians.
/// # Returns
/// * The wrapped angle in $(-\pi, \pi]$.
/// # Example
/// ```rust
/// use fusetrack::wrap_to_pi;
/// use std::f64::consts::PI;
/// let angle = 3.0 * PI / 2.0;
/// let wrapped_angle = wrap_to_pi(angle);
/// assert_eq!(wrapped_angle, -PI / 2.0);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    use std::f64::consts::PI;
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Clamp a radar range away from zero before it is used as a divisor.
///
/// # Arguments
/// * `range` - The radial distance in meters.
/// # Returns
/// * `range`, or [RANGE_EPSILON] if the range was smaller.
#[inline]
pub fn clamp_range(range: f64) -> f64 {
    range.max(RANGE_EPSILON)
}

/// Clamp an initial raw coordinate away from zero.
///
/// A track seeded exactly at the origin makes the polar measurement model
/// degenerate on the very next radar update, so coordinates within
/// [COORDINATE_EPSILON] of zero are replaced by that epsilon.
///
/// # Arguments
/// * `coordinate` - The raw coordinate in meters.
#[inline]
pub fn clamp_initial_coordinate(coordinate: f64) -> f64 {
    if coordinate.abs() < COORDINATE_EPSILON {
        COORDINATE_EPSILON
    } else {
        coordinate
    }
}
