use crate::error::Result;
use crate::storage::{open_profile, query_summary, query_totals};
use comfy_table::presets::NOTHING;
use comfy_table::{CellAlignment, Table};
use std::path::{Path, PathBuf};

/// Profile info extracted from a database file
pub struct ProfileInfo {
    pub path: PathBuf,
    pub process_name: String,
    pub pid: u32,
    pub duration_secs: f64,
    pub samples: u64,
    pub total_bytes: u64,
    pub created: String,
}

/// Find all cmemprof profile databases in a directory
pub fn find_profiles(dir: &Path) -> Result<Vec<ProfileInfo>> {
    let mut profiles = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.starts_with("cmemprof.")
            && name.ends_with(".db")
        {
            match get_profile_info(&path) {
                Ok(info) => profiles.push(info),
                Err(err) => tracing::debug!(path = %path.display(), %err, "skipping"),
            }
        }
    }

    // Most recent first
    profiles.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(profiles)
}

pub fn most_recent_profile(dir: &Path) -> Result<Option<PathBuf>> {
    let profiles = find_profiles(dir)?;
    Ok(profiles.into_iter().next().map(|p| p.path))
}

fn get_profile_info(path: &Path) -> Result<ProfileInfo> {
    let conn = open_profile(path)?;
    let summary = query_summary(&conn)?;
    let totals = query_totals(&conn)?;

    Ok(ProfileInfo {
        path: path.to_path_buf(),
        process_name: summary.process_name,
        pid: summary.pid,
        duration_secs: summary.duration_ms as f64 / 1000.0,
        samples: summary.sample_count,
        total_bytes: totals.alloc_bytes,
        created: summary.start_time,
    })
}

fn format_duration(secs: f64) -> String {
    if secs >= 60.0 {
        format!("{:.0}m{:02.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}

pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let profiles = find_profiles(search_dir)?;

    if profiles.is_empty() {
        println!("No cmemprof profiles found in {}", search_dir.display());
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_header(vec!["FILE", "PROCESS", "PID", "DURATION", "SAMPLES", "BYTES"]);

    for profile in &profiles {
        let filename = profile
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        table.add_row(vec![
            filename,
            profile.process_name.clone(),
            profile.pid.to_string(),
            format_duration(profile.duration_secs),
            profile.samples.to_string(),
            profile.total_bytes.to_string(),
        ]);
    }
    for idx in 2..6 {
        if let Some(column) = table.column_mut(idx) {
            column.set_cell_alignment(CellAlignment::Right);
        }
    }

    println!("{table}");
    Ok(())
}
