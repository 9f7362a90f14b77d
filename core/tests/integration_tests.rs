//! Integration tests exercising the fusion filter end to end: initialization,
//! mixed-sensor tracking, consistency diagnostics, and the log I/O round trip.

use assert_approx_eq::assert_approx_eq;
use nalgebra::linalg::SymmetricEigen;

use fusetrack::CtrvState;
use fusetrack::kalman::{UkfConfig, UnscentedKalmanFilter};
use fusetrack::measurements::Measurement;
use fusetrack::sim::{
    CHI_SQUARED_95_2DOF, CHI_SQUARED_95_3DOF, EstimateRecord, nis_exceedance_fraction,
    parse_measurement_log, read_measurement_log, run_fusion, simulate_ctrv,
};

fn turning_target() -> CtrvState {
    CtrvState {
        position_x: 10.0,
        position_y: 5.0,
        speed: 3.0,
        heading: 0.6,
        turn_rate: 0.25,
    }
}

#[test]
fn two_lidar_fixes_converge_without_teleporting() {
    let mut filter = UnscentedKalmanFilter::new(UkfConfig::default());
    filter
        .process_measurement(&Measurement::lidar(0, 1.0, 0.5))
        .expect("initialization should succeed");
    assert!(filter.is_initialized());
    assert_approx_eq!(filter.state()[0], 1.0, 1e-12);
    assert_approx_eq!(filter.state()[1], 0.5, 1e-12);

    filter
        .process_measurement(&Measurement::lidar(100_000, 1.2, 0.55))
        .expect("update should succeed");
    // The filter moved toward the new fix but did not teleport to it,
    // because the initial covariance was nontrivial.
    let position_x = filter.state()[0];
    assert!(
        position_x > 1.0 && position_x < 1.2,
        "position_x = {}",
        position_x
    );
    // Position uncertainty shrank relative to the identity initialization.
    assert!(filter.covariance()[(0, 0)] < 1.0);
    assert!(filter.covariance()[(1, 1)] < 1.0);
}

#[test]
fn mixed_sensor_tracking_stays_close_to_ground_truth() {
    let config = UkfConfig::default();
    let entries = simulate_ctrv(turning_target(), 200, 0.05, &config, 3);
    let run = run_fusion(&entries, config).expect("run should succeed");
    let rmse = run.rmse.expect("synthetic entries carry ground truth");
    // Position error on the order of the lidar noise; velocity takes a while
    // to converge from the zero initialization, so its bound is looser.
    assert!(rmse[0] < 0.5, "px rmse = {}", rmse[0]);
    assert!(rmse[1] < 0.5, "py rmse = {}", rmse[1]);
    assert!(rmse[2] < 2.0, "vx rmse = {}", rmse[2]);
    assert!(rmse[3] < 2.0, "vy rmse = {}", rmse[3]);
}

#[test]
fn covariance_stays_symmetric_and_psd_over_a_long_run() {
    let config = UkfConfig::default();
    let entries = simulate_ctrv(turning_target(), 100, 0.1, &config, 5);
    let mut filter = UnscentedKalmanFilter::new(config);
    for entry in &entries {
        filter
            .process_measurement(&entry.measurement)
            .expect("healthy scenario should never fail");
        let covariance = filter.covariance();
        for i in 0..5 {
            for j in 0..5 {
                assert_approx_eq!(covariance[(i, j)], covariance[(j, i)], 1e-9);
            }
        }
        let eigen = SymmetricEigen::new(covariance.clone());
        for eigenvalue in eigen.eigenvalues.iter() {
            assert!(
                *eigenvalue > -1e-9,
                "covariance picked up a negative eigenvalue: {}",
                eigenvalue
            );
        }
    }
}

#[test]
fn nis_is_statistically_consistent_on_a_matched_scenario() {
    // The measurement noise in the scenario matches what the filter assumes,
    // so the fraction of NIS values above the 95% chi-squared threshold
    // should sit near 5%. The truth trajectory is deterministic while the
    // filter carries process noise, which biases NIS slightly low; the check
    // is one-sided and coarse by design.
    let config = UkfConfig::default();
    let entries = simulate_ctrv(turning_target(), 400, 0.05, &config, 17);
    let run = run_fusion(&entries, config).expect("run should succeed");

    let lidar_nis: Vec<f64> = run
        .records
        .iter()
        .filter(|record| record.sensor == "lidar")
        .filter_map(|record| record.nis)
        .collect();
    let radar_nis: Vec<f64> = run
        .records
        .iter()
        .filter(|record| record.sensor == "radar")
        .filter_map(|record| record.nis)
        .collect();
    assert!(lidar_nis.len() >= 190);
    assert!(radar_nis.len() >= 190);

    let lidar_fraction = nis_exceedance_fraction(&lidar_nis, CHI_SQUARED_95_2DOF);
    let radar_fraction = nis_exceedance_fraction(&radar_nis, CHI_SQUARED_95_3DOF);
    assert!(
        lidar_fraction < 0.25,
        "lidar NIS exceedance = {}",
        lidar_fraction
    );
    assert!(
        radar_fraction < 0.25,
        "radar NIS exceedance = {}",
        radar_fraction
    );

    let lidar_mean = lidar_nis.iter().sum::<f64>() / lidar_nis.len() as f64;
    let radar_mean = radar_nis.iter().sum::<f64>() / radar_nis.len() as f64;
    assert!(lidar_mean < 4.0, "lidar NIS mean = {}", lidar_mean);
    assert!(radar_mean < 6.0, "radar NIS mean = {}", radar_mean);
}

#[test]
fn measurement_log_round_trips_through_the_filesystem() {
    let log = "L\t1.0\t0.5\t1000000\t1.0\t0.5\t2.0\t0.1\n\
R\t1.2\t0.45\t1.9\t1050000\t1.05\t0.51\t2.0\t0.1\n\
L\t1.1\t0.52\t1100000\t1.1\t0.52\t2.0\t0.1\n";
    let log_path = std::env::temp_dir().join("fusetrack_integration_log.tsv");
    std::fs::write(&log_path, log).expect("temp log should be writable");

    let from_file = read_measurement_log(&log_path).expect("log should parse from disk");
    let from_memory = parse_measurement_log(log.as_bytes()).expect("log should parse from memory");
    assert_eq!(from_file.len(), 3);
    assert_eq!(from_file.len(), from_memory.len());
    for (a, b) in from_file.iter().zip(from_memory.iter()) {
        assert_eq!(
            a.measurement.timestamp_micros,
            b.measurement.timestamp_micros
        );
        assert_eq!(a.measurement.sensor_name(), b.measurement.sensor_name());
    }

    let run = run_fusion(&from_file, UkfConfig::default()).expect("run should succeed");
    assert_eq!(run.records.len(), 3);
    assert!(run.rmse.is_some());

    let csv_path = std::env::temp_dir().join("fusetrack_integration_estimates.csv");
    EstimateRecord::to_csv(&run.records, &csv_path).expect("estimates should serialize");
    let written = std::fs::read_to_string(&csv_path).expect("estimates file should exist");
    assert!(written.lines().count() >= 4); // header plus three records
    assert!(written.contains("lidar"));
    assert!(written.contains("radar"));

    std::fs::remove_file(&log_path).ok();
    std::fs::remove_file(&csv_path).ok();
}

#[test]
fn filter_and_runner_both_reject_time_reversal() {
    let entries = vec![
        fusetrack::sim::SensorLogEntry {
            measurement: Measurement::lidar(2_000_000, 1.0, 1.0),
            ground_truth: None,
        },
        fusetrack::sim::SensorLogEntry {
            measurement: Measurement::lidar(1_000_000, 1.1, 1.0),
            ground_truth: None,
        },
    ];
    assert!(run_fusion(&entries, UkfConfig::default()).is_err());

    let mut filter = UnscentedKalmanFilter::new(UkfConfig::default());
    filter
        .process_measurement(&entries[0].measurement)
        .expect("initialization should succeed");
    let state_before = filter.state().clone();
    assert!(
        filter
            .process_measurement(&entries[1].measurement)
            .is_err()
    );
    assert_eq!(filter.state(), &state_before);
}
