//! Unscented Kalman filter for radar/lidar sensor fusion
//!
//! This module contains the unscented Kalman filter (UKF) implementation of
//! the CTRV tracking estimator. The filter owns the full state (mean vector
//! and covariance matrix) and implements sigma-point augmentation, nonlinear
//! state prediction through the CTRV model provided by the top-level [crate]
//! module, measurement prediction for both sensors, and the Kalman-gain
//! update step that folds a new measurement into the state.
//!
//! # Mathematical Background
//!
//! The unscented transform represents the state distribution by a small set
//! of deterministically chosen sigma points which are pushed through the
//! nonlinear motion model, after which mean and covariance are reconstructed
//! as weighted sums:
//!
//! $$
//! \chi_0 = \mu, \qquad
//! \chi_i = \mu \pm \sqrt{(\lambda + n)}\\,\mathrm{col}_i(L), \qquad
//! P = L L^T
//! $$
//!
//! with the spreading parameter fixed at $\lambda = 3 - n$ and a single
//! weight vector $w_0 = \lambda / (\lambda + n)$,
//! $w_i = 1 / (2(\lambda + n))$ reused for every reconstruction.
//!
//! Process noise is handled by *augmentation*: the state is extended with the
//! two zero-mean noise accelerations so their effect is propagated through
//! the nonlinearity jointly with the state uncertainty rather than bolted on
//! as an additive term afterwards.
//!
//! The two sensors take different update paths:
//!
//! - **Lidar** observes `[px, py]` linearly, so the update is the closed-form
//!   Kalman update ($K = P H^T S^{-1}$, $P \leftarrow (I - K H) P$), which is
//!   both exact and cheaper than the sigma-point path.
//! - **Radar** observes `(rho, theta, rho_dot)` nonlinearly, so the predicted
//!   sigma points are mapped into measurement space and the gain is built
//!   from the cross correlation, with every angle difference wrapped.
//!
//! Each update records the Normalized Innovation Squared
//! ($\mathrm{NIS} = y^T S^{-1} y$) for the matching sensor as a consistency
//! diagnostic; it does not influence control flow.
//!
//! # References
//! - Julier, S. J. and Uhlmann, J. K. "New extension of the Kalman filter to
//!   nonlinear systems", 1997
//! - Bar-Shalom, Y., et al. "Estimation with Applications to Tracking and
//!   Navigation", Chapter 10-11

use std::fmt::{self, Debug, Display};

use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::{cholesky_sqrt, spd_solve, spd_solve_vector, symmetrize};
use crate::measurements::{LidarMeasurement, Measurement, MeasurementModel, SensorData};
use crate::{
    CtrvState, FilterError, MIN_PREDICTION_DT, ProcessNoise, clamp_initial_coordinate,
    ctrv_forward, wrap_to_pi,
};

/// State dimension: `[px, py, v, psi, psi_dot]`
pub const N_X: usize = 5;
/// Augmented state dimension: state plus the two process-noise accelerations
pub const N_AUG: usize = 7;
/// Number of sigma points for the augmented state
pub const N_SIGMA: usize = 2 * N_AUG + 1;
/// Sigma-point spreading parameter
pub const LAMBDA: f64 = 3.0 - N_AUG as f64;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Noise configuration for the fusion filter.
///
/// Supplied once at construction and immutable afterwards. The process-noise
/// standard deviations describe how aggressively the tracked object is
/// expected to maneuver; the measurement standard deviations come from the
/// sensor datasheets. Defaults match a slow ground target tracked by
/// automotive-grade sensors.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct UkfConfig {
    /// Process noise standard deviation, longitudinal acceleration in m/s^2
    pub std_accel: f64,
    /// Process noise standard deviation, yaw acceleration in rad/s^2
    pub std_yaw_accel: f64,
    /// Lidar measurement noise standard deviation, x position in m
    pub std_lidar_x: f64,
    /// Lidar measurement noise standard deviation, y position in m
    pub std_lidar_y: f64,
    /// Radar measurement noise standard deviation, range in m
    pub std_radar_range: f64,
    /// Radar measurement noise standard deviation, bearing in rad
    pub std_radar_bearing: f64,
    /// Radar measurement noise standard deviation, range rate in m/s
    pub std_radar_range_rate: f64,
}

impl Default for UkfConfig {
    fn default() -> Self {
        UkfConfig {
            std_accel: 0.2,
            std_yaw_accel: 0.2,
            std_lidar_x: 0.15,
            std_lidar_y: 0.15,
            std_radar_range: 0.3,
            std_radar_bearing: 0.03,
            std_radar_range_rate: 0.3,
        }
    }
}

/// Unscented Kalman Filter implementation
///
/// The filter owns the state mean and covariance exclusively; they are the
/// only data persisted between measurements. Every call to
/// [UnscentedKalmanFilter::process_measurement] either fully updates them or
/// fails atomically with the state untouched (the stored timestamp is the one
/// exception: it is advanced immediately so a failed or skipped prediction
/// can never double-count elapsed time).
#[derive(Clone)]
pub struct UnscentedKalmanFilter {
    config: UkfConfig,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    weights: DVector<f64>,
    previous_timestamp_micros: i64,
    initialized: bool,
    nis_lidar: Option<f64>,
    nis_radar: Option<f64>,
}

impl Debug for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UKF")
            .field("state", &self.state)
            .field("covariance", &self.covariance)
            .field("initialized", &self.initialized)
            .field("previous_timestamp_micros", &self.previous_timestamp_micros)
            .finish()
    }
}

impl Display for UnscentedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.initialized {
            write!(f, "UnscentedKalmanFilter {{ {} }}", self.estimate())
        } else {
            write!(f, "UnscentedKalmanFilter {{ uninitialized }}")
        }
    }
}

impl UnscentedKalmanFilter {
    /// Create a new, uninitialized filter with the given noise configuration.
    ///
    /// The first measurement handed to [Self::process_measurement] (or
    /// [Self::initialize]) seeds the state; no estimate is available before
    /// then.
    pub fn new(config: UkfConfig) -> UnscentedKalmanFilter {
        let n_aug = N_AUG as f64;
        let mut weights = DVector::zeros(N_SIGMA);
        weights[0] = LAMBDA / (n_aug + LAMBDA);
        for i in 1..N_SIGMA {
            weights[i] = 1.0 / (2.0 * (n_aug + LAMBDA));
        }
        UnscentedKalmanFilter {
            config,
            state: DVector::zeros(N_X),
            covariance: DMatrix::identity(N_X, N_X),
            weights,
            previous_timestamp_micros: 0,
            initialized: false,
            nis_lidar: None,
            nis_radar: None,
        }
    }

    /// Seed the state from the very first measurement.
    ///
    /// Position comes directly from a lidar fix, or from the polar-to-
    /// Cartesian conversion of a radar detection. Speed, heading, and turn
    /// rate start at zero: radar range rate alone does not determine the full
    /// velocity, so it is deliberately not used here. The covariance starts
    /// at identity and the measurement timestamp becomes the time baseline.
    /// No prediction or update math runs on this call.
    pub fn initialize(&mut self, measurement: &Measurement) -> Result<(), FilterError> {
        measurement.validate()?;
        let (position_x, position_y) = match &measurement.data {
            SensorData::Lidar(lidar) => (lidar.position_x, lidar.position_y),
            SensorData::Radar(radar) => (
                radar.range * radar.bearing.cos(),
                radar.range * radar.bearing.sin(),
            ),
        };
        self.state = DVector::zeros(N_X);
        self.state[0] = clamp_initial_coordinate(position_x);
        self.state[1] = clamp_initial_coordinate(position_y);
        self.covariance = DMatrix::identity(N_X, N_X);
        self.previous_timestamp_micros = measurement.timestamp_micros;
        self.nis_lidar = None;
        self.nis_radar = None;
        self.initialized = true;
        debug!(
            "initialized from {} measurement at {} us: {}",
            measurement.sensor_name(),
            measurement.timestamp_micros,
            self.estimate()
        );
        Ok(())
    }

    /// Process one measurement: the single entry point for the fusion loop.
    ///
    /// The first call initializes the filter and returns. Every later call
    /// computes the elapsed time since the previous measurement, runs the
    /// unscented prediction when that time is non-negligible, and then runs
    /// the update step matching the measurement's sensor type. Measurements
    /// must arrive in non-decreasing timestamp order.
    pub fn process_measurement(&mut self, measurement: &Measurement) -> Result<(), FilterError> {
        if !self.initialized {
            return self.initialize(measurement);
        }
        measurement.validate()?;
        let elapsed_micros = measurement.timestamp_micros - self.previous_timestamp_micros;
        if elapsed_micros < 0 {
            return Err(FilterError::NonMonotonicTimestamp {
                previous_micros: self.previous_timestamp_micros,
                current_micros: measurement.timestamp_micros,
            });
        }
        // Advance the time baseline before any fallible math so a failed
        // prediction cannot double-count elapsed time on the next call.
        self.previous_timestamp_micros = measurement.timestamp_micros;
        let delta_t = elapsed_micros as f64 / MICROS_PER_SECOND;
        // Below the threshold the prediction is skipped: propagating for an
        // effective dt of zero is the identity on mean and covariance but
        // still refreshes the predicted sigma points the radar update needs.
        let effective_dt = if delta_t > MIN_PREDICTION_DT {
            delta_t
        } else {
            0.0
        };
        trace!(
            "processing {} measurement, dt = {:.6} s (effective {:.6} s)",
            measurement.sensor_name(),
            delta_t,
            effective_dt
        );
        let (predicted_state, predicted_covariance, predicted_sigma) =
            self.predict(effective_dt)?;
        match &measurement.data {
            SensorData::Lidar(lidar) => {
                let (state, covariance, nis) =
                    self.update_lidar(lidar, predicted_state, predicted_covariance)?;
                self.state = state;
                self.covariance = covariance;
                self.nis_lidar = Some(nis);
            }
            SensorData::Radar(radar) => {
                let (state, covariance, nis) = self.update_unscented(
                    radar,
                    self.radar_noise(),
                    predicted_state,
                    predicted_covariance,
                    &predicted_sigma,
                )?;
                self.state = state;
                self.covariance = covariance;
                self.nis_radar = Some(nis);
            }
        }
        trace!("posterior {}", self.estimate());
        Ok(())
    }

    /// Generate the augmented sigma-point matrix (N_AUG x N_SIGMA).
    ///
    /// The augmented mean is the state mean followed by the two zero-mean
    /// noise accelerations; the augmented covariance carries the state
    /// covariance in its top-left block and the noise variances on the
    /// remaining diagonal.
    fn augmented_sigma_points(&self) -> Result<DMatrix<f64>, FilterError> {
        let mut mean_aug = DVector::<f64>::zeros(N_AUG);
        mean_aug.rows_mut(0, N_X).copy_from(&self.state);
        let mut covariance_aug = DMatrix::<f64>::zeros(N_AUG, N_AUG);
        covariance_aug
            .view_mut((0, 0), (N_X, N_X))
            .copy_from(&self.covariance);
        covariance_aug[(5, 5)] = self.config.std_accel.powi(2);
        covariance_aug[(6, 6)] = self.config.std_yaw_accel.powi(2);

        let sqrt_covariance = cholesky_sqrt(&covariance_aug)?;
        let spread = (LAMBDA + N_AUG as f64).sqrt();
        let mut sigma_points = DMatrix::<f64>::zeros(N_AUG, N_SIGMA);
        sigma_points.column_mut(0).copy_from(&mean_aug);
        for i in 0..N_AUG {
            let offset = spread * sqrt_covariance.column(i);
            sigma_points
                .column_mut(i + 1)
                .copy_from(&(&mean_aug + &offset));
            sigma_points
                .column_mut(i + 1 + N_AUG)
                .copy_from(&(&mean_aug - &offset));
        }
        Ok(sigma_points)
    }

    /// Unscented prediction: advance mean and covariance by `delta_t` seconds
    /// through the CTRV model.
    ///
    /// Returns the predicted mean, the predicted covariance, and the
    /// predicted sigma-point matrix (N_X x N_SIGMA) for reuse by the radar
    /// update. Nothing is committed to the filter state here; the caller
    /// commits after its update step succeeds.
    fn predict(
        &self,
        delta_t: f64,
    ) -> Result<(DVector<f64>, DMatrix<f64>, DMatrix<f64>), FilterError> {
        let sigma_aug = self.augmented_sigma_points()?;
        let mut sigma_pred = DMatrix::<f64>::zeros(N_X, N_SIGMA);
        for i in 0..N_SIGMA {
            let mut point = CtrvState {
                position_x: sigma_aug[(0, i)],
                position_y: sigma_aug[(1, i)],
                speed: sigma_aug[(2, i)],
                heading: sigma_aug[(3, i)],
                turn_rate: sigma_aug[(4, i)],
            };
            let noise = ProcessNoise {
                longitudinal_accel: sigma_aug[(5, i)],
                yaw_accel: sigma_aug[(6, i)],
            };
            ctrv_forward(&mut point, noise, delta_t);
            sigma_pred[(0, i)] = point.position_x;
            sigma_pred[(1, i)] = point.position_y;
            sigma_pred[(2, i)] = point.speed;
            sigma_pred[(3, i)] = point.heading;
            sigma_pred[(4, i)] = point.turn_rate;
        }

        let mut mean = DVector::<f64>::zeros(N_X);
        for (i, sigma_point) in sigma_pred.column_iter().enumerate() {
            mean += self.weights[i] * sigma_point;
        }
        let mut covariance = DMatrix::<f64>::zeros(N_X, N_X);
        for (i, sigma_point) in sigma_pred.column_iter().enumerate() {
            let mut diff = sigma_point - &mean;
            diff[3] = wrap_to_pi(diff[3]);
            covariance += self.weights[i] * &diff * diff.transpose();
        }
        Ok((mean, symmetrize(&covariance), sigma_pred))
    }

    /// Closed-form linear Kalman update for a lidar position fix.
    ///
    /// Lidar's measurement model is exactly `z = H x`, so the unscented
    /// machinery is unnecessary; the classic update is exact and cheaper.
    fn update_lidar(
        &self,
        lidar: &LidarMeasurement,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>, f64), FilterError> {
        let observation = LidarMeasurement::observation_matrix();
        let innovation = lidar.vector() - &observation * &state;
        let innovation_covariance =
            &observation * &covariance * observation.transpose() + self.lidar_noise();
        let gain = self.kalman_gain(
            &(&covariance * observation.transpose()),
            &innovation_covariance,
        )?;
        let nis = innovation.dot(&spd_solve_vector(&innovation_covariance, &innovation)?);

        let state = state + &gain * &innovation;
        let identity = DMatrix::<f64>::identity(N_X, N_X);
        let covariance = symmetrize(&((identity - &gain * &observation) * covariance));
        Ok((state, covariance, nis))
    }

    /// Sigma-point measurement update for a nonlinear measurement model.
    ///
    /// Reuses the predicted state sigma points (no re-augmentation: the
    /// measurement noise is additive and enters the innovation covariance
    /// directly). Angle-valued components named by the model have every
    /// difference wrapped into (-pi, pi].
    fn update_unscented<M: MeasurementModel + ?Sized>(
        &self,
        measurement: &M,
        noise: DMatrix<f64>,
        state: DVector<f64>,
        covariance: DMatrix<f64>,
        sigma_pred: &DMatrix<f64>,
    ) -> Result<(DVector<f64>, DMatrix<f64>, f64), FilterError> {
        let dimension = measurement.dimension();
        let angular = measurement.angular_components();

        let mut sigma_meas = DMatrix::<f64>::zeros(dimension, N_SIGMA);
        let mut predicted_measurement = DVector::<f64>::zeros(dimension);
        for (i, sigma_point) in sigma_pred.column_iter().enumerate() {
            let projected = measurement.expected_measurement(&sigma_point.clone_owned());
            predicted_measurement += self.weights[i] * &projected;
            sigma_meas.set_column(i, &projected);
        }

        let mut innovation_covariance = noise;
        for (i, sigma_point) in sigma_meas.column_iter().enumerate() {
            let mut diff = sigma_point - &predicted_measurement;
            for &component in angular {
                diff[component] = wrap_to_pi(diff[component]);
            }
            innovation_covariance += self.weights[i] * &diff * diff.transpose();
        }

        let mut cross_covariance = DMatrix::<f64>::zeros(N_X, dimension);
        for i in 0..N_SIGMA {
            let mut state_diff = sigma_pred.column(i) - &state;
            state_diff[3] = wrap_to_pi(state_diff[3]);
            let mut measurement_diff = sigma_meas.column(i) - &predicted_measurement;
            for &component in angular {
                measurement_diff[component] = wrap_to_pi(measurement_diff[component]);
            }
            cross_covariance += self.weights[i] * state_diff * measurement_diff.transpose();
        }

        let gain = self.kalman_gain(&cross_covariance, &innovation_covariance)?;
        let mut innovation = measurement.vector() - predicted_measurement;
        for &component in angular {
            innovation[component] = wrap_to_pi(innovation[component]);
        }
        let nis = innovation.dot(&spd_solve_vector(&innovation_covariance, &innovation)?);

        let state = state + &gain * &innovation;
        let covariance =
            symmetrize(&(covariance - &gain * &innovation_covariance * gain.transpose()));
        Ok((state, covariance, nis))
    }

    /// Kalman gain `K = C S⁻¹` from a cross covariance `C` and an innovation
    /// covariance `S`, computed as an SPD solve on the transposed system
    /// rather than an explicit inverse.
    fn kalman_gain(
        &self,
        cross_covariance: &DMatrix<f64>,
        innovation_covariance: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, FilterError> {
        let gain_transposed = spd_solve(innovation_covariance, &cross_covariance.transpose())?;
        Ok(gain_transposed.transpose())
    }

    fn lidar_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.config.std_lidar_x.powi(2),
            self.config.std_lidar_y.powi(2),
        ]))
    }

    fn radar_noise(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_vec(vec![
            self.config.std_radar_range.powi(2),
            self.config.std_radar_bearing.powi(2),
            self.config.std_radar_range_rate.powi(2),
        ]))
    }

    /// The current state mean `[px, py, v, psi, psi_dot]`.
    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    /// The current state covariance (5x5).
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// The current estimate as a [CtrvState].
    pub fn estimate(&self) -> CtrvState {
        CtrvState {
            position_x: self.state[0],
            position_y: self.state[1],
            speed: self.state[2],
            heading: self.state[3],
            turn_rate: self.state[4],
        }
    }

    /// The noise configuration the filter was built with.
    pub fn config(&self) -> &UkfConfig {
        &self.config
    }

    /// Whether the filter has been seeded by a first measurement.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// NIS of the most recent lidar update, if any.
    pub fn nis_lidar(&self) -> Option<f64> {
        self.nis_lidar
    }

    /// NIS of the most recent radar update, if any.
    pub fn nis_radar(&self) -> Option<f64> {
        self.nis_radar
    }
}
