use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use tempfile::TempDir;
use vetrack::core::tracker::LatestDataTrigger;
use vetrack::core::EchoTracker;
use vetrack::io::grid_file::{grid_file_name, read_grid_file, write_grid_file};
use vetrack::io::{FieldSelector, GridFileSink, GridFileSource};
use vetrack::params::{TrackerParams, TriggerMode};
use vetrack::types::{GridGeometry, ScalarField};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

/// Write a uniform DBZ field (plus a distractor) valid at `time`
fn write_scan(dir: &Path, nx: usize, time: DateTime<Utc>) {
    let geometry = GridGeometry::flat(nx, 6, 1.0, 1.0).unwrap();
    let dbz = ScalarField::constant("DBZ", geometry, 25.0, -999.0, time)
        .unwrap()
        .with_units("dBZ");
    let zdr = ScalarField::constant("ZDR", geometry, 1.5, -999.0, time).unwrap();
    write_grid_file(dir.join(grid_file_name("radar", time)), &[&zdr, &dbz]).expect("write scan");
}

fn params_xml(input: &Path, output: &Path, gradients: bool) -> String {
    format!(
        r#"<params>
            <max_iterations>20</max_iterations>
            <constant_motion><u>4.0</u><v>-2.0</v></constant_motion>
            <output_gradients>{}</output_gradients>
            <base_field_info>
                <input_dir>{}</input_dir>
                <use_field_name>true</use_field_name>
                <field_name>DBZ</field_name>
                <search_margin_secs>30</search_margin_secs>
            </base_field_info>
            <output_dir>{}</output_dir>
            <trigger_mode>time_list</trigger_mode>
            <time_list>
                <start_time>2024-05-01T12:00:00Z</start_time>
                <end_time>2024-05-01T12:30:00Z</end_time>
            </time_list>
        </params>"#,
        gradients,
        input.display(),
        output.display()
    )
}

#[test]
fn test_time_list_pipeline_writes_one_file_per_pairing() {
    init_logging();

    let input = TempDir::new().expect("Failed to create temp directory");
    let output = TempDir::new().expect("Failed to create temp directory");
    for minutes in [0, 5, 10] {
        write_scan(input.path(), 7, t(minutes));
    }
    // Outside the processing window
    write_scan(input.path(), 7, t(45));

    let params = TrackerParams::from_xml(&params_xml(input.path(), output.path(), false)).unwrap();
    assert_eq!(params.trigger_mode, TriggerMode::TimeList);

    let mut source = GridFileSource::from_params(&params.base_field_info);
    let mut sink = GridFileSink::new(&params.output_dir);
    let mut tracker = EchoTracker::from_params(&params);

    let stats = tracker
        .run_configured(&params, &mut source, &mut sink)
        .expect("pipeline should run");

    println!("Stats: {:?}", stats);
    assert_eq!(stats.fields_read, 3);
    assert_eq!(stats.outputs_written, 2);
    assert_eq!(stats.failed_pairings(), 0);

    let expected: Vec<_> = [5, 10]
        .iter()
        .map(|m| output.path().join(grid_file_name("vet", t(*m))))
        .collect();
    assert_eq!(sink.written(), expected.as_slice());

    let fields = read_grid_file(&expected[0]).unwrap();
    let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["U", "V"]);
    assert_eq!(fields[0].units, "m/s");
    assert_eq!((fields[0].nx(), fields[0].ny()), (7, 6));
    assert_eq!(fields[0].timestamp, t(5));
    assert!(fields[0].data().iter().all(|v| *v == 4.0));
    assert!(fields[1].data().iter().all(|v| *v == -2.0));
}

#[test]
fn test_gradient_fields_are_written_when_requested() {
    init_logging();

    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_scan(input.path(), 5, t(0));
    write_scan(input.path(), 5, t(6));

    let params = TrackerParams::from_xml(&params_xml(input.path(), output.path(), true)).unwrap();
    let mut source = GridFileSource::from_params(&params.base_field_info);
    let mut sink = GridFileSink::new(output.path()).with_prefix("motion");
    let mut tracker = EchoTracker::from_params(&params);

    let stats = tracker.run(&mut source, &mut sink, &[t(0), t(6)]).unwrap();
    assert_eq!(stats.outputs_written, 1);

    let fields = read_grid_file(output.path().join(grid_file_name("motion", t(6)))).unwrap();
    let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["U", "V", "U grad", "V grad"]);
    assert_eq!((fields[2].nx(), fields[2].ny()), (6, 5));
    assert_eq!((fields[3].nx(), fields[3].ny()), (5, 6));
}

#[test]
fn test_geometry_change_skips_one_pairing() {
    init_logging();

    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_scan(input.path(), 6, t(0));
    write_scan(input.path(), 8, t(5));
    write_scan(input.path(), 8, t(10));

    let mut source = GridFileSource::new(input.path(), FieldSelector::Name("DBZ".to_string()), 0);
    let mut sink = GridFileSink::new(output.path());
    let mut tracker = EchoTracker::from_params(&TrackerParams::default());

    let stats = tracker.run(&mut source, &mut sink, &[t(0), t(5), t(10)]).unwrap();

    assert_eq!(stats.pairings_skipped, 1);
    assert_eq!(stats.outputs_written, 1);
    assert_eq!(sink.written(), &[output.path().join(grid_file_name("vet", t(10)))]);
}

#[test]
fn test_missing_input_directory_is_fatal() {
    let output = TempDir::new().unwrap();
    let mut source = GridFileSource::new("/nonexistent/vetrack/input", FieldSelector::Index(0), 0);
    let mut sink = GridFileSink::new(output.path());
    let mut tracker = EchoTracker::from_params(&TrackerParams::default());

    assert!(tracker.run(&mut source, &mut sink, &[t(0), t(5)]).is_err());
    assert!(tracker.run_time_list(&mut source, &mut sink, t(0), t(5)).is_err());
}

#[test]
fn test_latest_data_reads_only_the_newest_file() {
    init_logging();

    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_scan(input.path(), 6, t(0));
    write_scan(input.path(), 6, t(5));

    let mut source = GridFileSource::new(input.path(), FieldSelector::Name("DBZ".to_string()), 0);
    let mut sink = GridFileSink::new(output.path());
    let mut tracker = EchoTracker::from_params(&TrackerParams::default());
    let mut trigger = LatestDataTrigger::new(std::time::Duration::ZERO);

    let stats = tracker
        .run_latest(&mut source, &mut sink, &mut trigger, Some(2))
        .expect("latest data run");

    // The older scan predates the trigger and is never paired
    assert_eq!(stats.fields_read, 1);
    assert_eq!(stats.outputs_written, 0);
    assert_eq!(tracker.previous().unwrap().timestamp, t(5));
    assert!(sink.written().is_empty());
}
