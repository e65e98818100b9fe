use crate::metrics::{format_throughput, Metrics};

#[test]
fn throughput_is_bytes_over_seconds() {
    let m = Metrics::new(1000, 2.0);
    assert!((m.throughput_bytes_per_sec() - 500.0).abs() < f64::EPSILON);
}

#[test]
fn zero_elapsed_reports_zero_throughput() {
    let m = Metrics::new(1000, 0.0);
    assert_eq!(m.throughput_bytes_per_sec(), 0.0);
}

#[test]
fn formats_in_largest_unit_under_1000() {
    assert_eq!(format_throughput(0.0), "0.00 B/s");
    assert_eq!(format_throughput(999.0), "999.00 B/s");
    assert_eq!(format_throughput(1000.0), "0.98 KiB/s");
    assert_eq!(format_throughput(1536.0), "1.50 KiB/s");
    assert_eq!(format_throughput(2.5 * 1024.0 * 1024.0), "2.50 MiB/s");
    assert_eq!(
        format_throughput(3.0 * 1024.0 * 1024.0 * 1024.0),
        "3.00 GiB/s"
    );
    // GiB/s is the largest unit even for absurd rates.
    assert_eq!(
        format_throughput(5000.0 * 1024.0 * 1024.0 * 1024.0),
        "5000.00 GiB/s"
    );
}
