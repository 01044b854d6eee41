//! Output formatting utilities for tierctl

use tiercache_storage::{Manifest, SegmentDescriptor};

/// Human readable byte count (1024-based).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// One line per segment, aligned for terminal output.
pub fn segment_row(segment: &SegmentDescriptor) -> String {
    format!(
        "  [{:>12}, {:>12})  {:>10}  v{}  {}  {}",
        segment.base_offset,
        segment.committed_offset,
        format_bytes(segment.size_bytes),
        segment.format_version,
        segment.checksum,
        segment.remote_key
    )
}

pub fn print_manifest(manifest: &Manifest) {
    println!("Partition: {}", manifest.partition);
    println!("  Revision: {}", manifest.revision);
    println!("  Segments: {}", manifest.len());
    println!("  Size: {}", format_bytes(manifest.total_size_bytes()));
    match manifest.last_committed_offset() {
        Some(end) => println!("  Tiered up to offset: {}", end),
        None => println!("  Nothing tiered yet"),
    }
    for segment in manifest.segments() {
        println!("{}", segment_row(segment));
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}
