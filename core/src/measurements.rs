//! Measurement-related code for the sensor-fusion tracker.
//!
//! This module defines a generic measurement model trait and the two concrete
//! sensor implementations the fusion filter understands: lidar (Cartesian
//! position) and radar (polar range, bearing, range rate). It also defines
//! the tagged [Measurement] type that carries a timestamp plus one sensor
//! reading into the filter.

use std::any::Any;
use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};

use crate::{FilterError, clamp_range};

/// Generic measurement model trait for all types of measurements
///
/// A measurement model knows its own dimension, its observed value as a
/// vector, and how to map a CTRV state vector into measurement space. Models
/// whose components include angles report their indices through
/// [MeasurementModel::angular_components] so the filter can wrap the
/// corresponding innovation components into $(-\pi, \pi]$.
pub trait MeasurementModel: Any {
    /// Downcast helper method to allow for type-safe downcasting
    fn as_any(&self) -> &dyn Any;
    /// Get the dimension of the measurement vector
    fn dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn vector(&self) -> DVector<f64>;
    /// Map a state vector `[px, py, v, psi, psi_dot]` into measurement space.
    fn expected_measurement(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Indices of angle-valued measurement components whose differences must
    /// be wrapped. Empty by default.
    fn angular_components(&self) -> &'static [usize] {
        &[]
    }
}

/// Lidar measurement: a Cartesian position fix.
///
/// The lidar observation function is exactly linear in the state
/// (`z = H x` with `H` selecting `[px, py]`), which is what lets the filter
/// use the closed-form Kalman update for this sensor.
#[derive(Clone, Copy, Debug, Default)]
pub struct LidarMeasurement {
    /// Measured position along the x axis in meters
    pub position_x: f64,
    /// Measured position along the y axis in meters
    pub position_y: f64,
}

impl Display for LidarMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LidarMeasurement(x: {}, y: {})",
            self.position_x, self.position_y
        )
    }
}

impl LidarMeasurement {
    /// The 2x5 observation matrix selecting `[px, py]` from the state.
    pub fn observation_matrix() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            5,
            &[
                1.0, 0.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, 0.0,
            ],
        )
    }
}

impl MeasurementModel for LidarMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn dimension(&self) -> usize {
        2
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.position_x, self.position_y])
    }
    fn expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![state[0], state[1]])
    }
}

/// Radar measurement: a polar detection.
///
/// The observation function is nonlinear in the state: range and bearing are
/// the polar form of the position, and the range rate is the velocity
/// component projected onto the line of sight:
///
/// $$
/// \rho = \sqrt{p_x^2 + p_y^2}, \quad
/// \theta = \operatorname{atan2}(p_y, p_x), \quad
/// \dot{\rho} = \frac{p_x v \cos\psi + p_y v \sin\psi}{\rho}
/// $$
///
/// The range in the denominator is clamped with [clamp_range]; a detection at
/// the origin is an expected edge case, not an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct RadarMeasurement {
    /// Radial distance from the sensor in meters
    pub range: f64,
    /// Bearing in radians, counterclockwise from the x axis
    pub bearing: f64,
    /// Radial velocity in m/s (positive away from the sensor)
    pub range_rate: f64,
}

impl Display for RadarMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadarMeasurement(rho: {}, phi: {}, rho_dot: {})",
            self.range, self.bearing, self.range_rate
        )
    }
}

impl MeasurementModel for RadarMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn dimension(&self) -> usize {
        3
    }
    fn vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.range, self.bearing, self.range_rate])
    }
    fn expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        let position_x = state[0];
        let position_y = state[1];
        let speed = state[2];
        let heading = state[3];
        let range = clamp_range((position_x * position_x + position_y * position_y).sqrt());
        let bearing = position_y.atan2(position_x);
        let range_rate =
            (position_x * heading.cos() * speed + position_y * heading.sin() * speed) / range;
        DVector::from_vec(vec![range, bearing, range_rate])
    }
    fn angular_components(&self) -> &'static [usize] {
        // the bearing
        &[1]
    }
}

/// One sensor reading, tagged by sensor type.
#[derive(Clone, Copy, Debug)]
pub enum SensorData {
    Lidar(LidarMeasurement),
    Radar(RadarMeasurement),
}

/// A timestamped measurement delivered to the fusion filter.
///
/// Timestamps are epoch microseconds, the native unit of the measurement
/// logs. Measurements must be delivered in non-decreasing timestamp order.
#[derive(Clone, Copy, Debug)]
pub struct Measurement {
    /// Epoch timestamp in microseconds
    pub timestamp_micros: i64,
    /// The sensor reading
    pub data: SensorData,
}

impl Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            SensorData::Lidar(lidar) => {
                write!(f, "{} @ {} us", lidar, self.timestamp_micros)
            }
            SensorData::Radar(radar) => {
                write!(f, "{} @ {} us", radar, self.timestamp_micros)
            }
        }
    }
}

impl Measurement {
    /// Create a lidar measurement from a Cartesian position fix.
    pub fn lidar(timestamp_micros: i64, position_x: f64, position_y: f64) -> Self {
        Measurement {
            timestamp_micros,
            data: SensorData::Lidar(LidarMeasurement {
                position_x,
                position_y,
            }),
        }
    }

    /// Create a radar measurement from a polar detection.
    pub fn radar(timestamp_micros: i64, range: f64, bearing: f64, range_rate: f64) -> Self {
        Measurement {
            timestamp_micros,
            data: SensorData::Radar(RadarMeasurement {
                range,
                bearing,
                range_rate,
            }),
        }
    }

    /// The measurement model for this reading, as a trait object.
    pub fn model(&self) -> &dyn MeasurementModel {
        match &self.data {
            SensorData::Lidar(lidar) => lidar,
            SensorData::Radar(radar) => radar,
        }
    }

    /// Short sensor name for logs and output records.
    pub fn sensor_name(&self) -> &'static str {
        match self.data {
            SensorData::Lidar(_) => "lidar",
            SensorData::Radar(_) => "radar",
        }
    }

    /// Reject measurements containing non-finite values before they reach
    /// the filter math. Dimensionality is enforced structurally by the
    /// per-sensor types.
    pub fn validate(&self) -> Result<(), FilterError> {
        let finite = match &self.data {
            SensorData::Lidar(lidar) => {
                lidar.position_x.is_finite() && lidar.position_y.is_finite()
            }
            SensorData::Radar(radar) => {
                radar.range.is_finite()
                    && radar.bearing.is_finite()
                    && radar.range_rate.is_finite()
            }
        };
        if finite {
            Ok(())
        } else {
            Err(FilterError::InvalidMeasurement(format!(
                "non-finite value in {} measurement at {} us",
                self.sensor_name(),
                self.timestamp_micros
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    const EPS: f64 = 1e-12;

    #[test]
    fn lidar_vector_and_expected_measurement() {
        let meas = LidarMeasurement {
            position_x: 1.5,
            position_y: -0.5,
        };
        let vec = meas.vector();
        assert_eq!(vec.len(), 2);
        assert_approx_eq!(vec[0], 1.5, EPS);
        assert_approx_eq!(vec[1], -0.5, EPS);

        let state = DVector::from_vec(vec![0.1, 1.1, 2.1, 3.0, 4.0]);
        let z = meas.expected_measurement(&state);
        assert_eq!(z.len(), 2);
        assert_approx_eq!(z[0], 0.1, EPS);
        assert_approx_eq!(z[1], 1.1, EPS);
        assert!(meas.angular_components().is_empty());
    }

    #[test]
    fn lidar_observation_matrix_selects_position() {
        let h = LidarMeasurement::observation_matrix();
        let state = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let z = &h * &state;
        assert_approx_eq!(z[0], 1.0, EPS);
        assert_approx_eq!(z[1], 2.0, EPS);
    }

    #[test]
    fn radar_expected_measurement_round_trips_position() {
        let meas = RadarMeasurement::default();
        let state = DVector::from_vec(vec![3.0, 4.0, 2.0, 0.3, 0.0]);
        let z = meas.expected_measurement(&state);
        assert_eq!(z.len(), 3);
        // convert back from polar
        let px = z[0] * z[1].cos();
        let py = z[0] * z[1].sin();
        assert_approx_eq!(px, 3.0, 1e-9);
        assert_approx_eq!(py, 4.0, 1e-9);
        // range rate is the velocity projected on the line of sight
        let expected_rate = (3.0 * 0.3_f64.cos() * 2.0 + 4.0 * 0.3_f64.sin() * 2.0) / 5.0;
        assert_approx_eq!(z[2], expected_rate, 1e-9);
        assert_eq!(meas.angular_components(), &[1]);
    }

    #[test]
    fn radar_expected_measurement_clamps_range_at_origin() {
        let meas = RadarMeasurement::default();
        let state = DVector::from_vec(vec![0.0, 0.0, 2.0, 0.0, 0.0]);
        let z = meas.expected_measurement(&state);
        assert!(z.iter().all(|value| value.is_finite()));
        assert_approx_eq!(z[0], crate::RANGE_EPSILON, EPS);
    }

    #[test]
    fn measurement_constructors_and_names() {
        let lidar = Measurement::lidar(10, 1.0, 2.0);
        assert_eq!(lidar.sensor_name(), "lidar");
        assert_eq!(lidar.model().dimension(), 2);
        assert_eq!(lidar.timestamp_micros, 10);

        let radar = Measurement::radar(20, 5.0, 0.1, -0.5);
        assert_eq!(radar.sensor_name(), "radar");
        assert_eq!(radar.model().dimension(), 3);
        assert_eq!(radar.model().angular_components(), &[1]);
    }

    #[test]
    fn validate_rejects_non_finite_values() {
        assert!(Measurement::lidar(0, 1.0, 2.0).validate().is_ok());
        assert!(Measurement::lidar(0, f64::NAN, 2.0).validate().is_err());
        assert!(
            Measurement::radar(0, 1.0, f64::INFINITY, 0.0)
                .validate()
                .is_err()
        );
        match Measurement::radar(0, f64::NAN, 0.0, 0.0).validate() {
            Err(FilterError::InvalidMeasurement(reason)) => {
                assert!(reason.contains("radar"));
            }
            other => panic!("expected InvalidMeasurement, got {:?}", other),
        }
    }

    #[test]
    fn downcast_trait_object_and_display() {
        let radar = RadarMeasurement {
            range: 5.0,
            bearing: 0.5,
            range_rate: -1.0,
        };
        let model: &dyn MeasurementModel = &radar;
        let down = model
            .as_any()
            .downcast_ref::<RadarMeasurement>()
            .expect("downcast failed");
        assert_approx_eq!(down.range, 5.0, EPS);

        let s = format!("{}", Measurement::radar(7, 5.0, 0.5, -1.0));
        assert!(s.contains("RadarMeasurement") && s.contains("7 us"));
    }
}
