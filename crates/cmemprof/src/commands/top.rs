use crate::error::Result;
use crate::storage::{HeapEntry, ProfileSummary, Totals, open_profile, query_summary, query_top_heap, query_totals};
use std::path::Path;

pub fn run(
    file: &Path,
    limit: usize,
    threshold: f64,
    json: bool,
    csv: bool,
    filter: Option<&str>,
) -> Result<()> {
    let conn = open_profile(file)?;
    let summary = query_summary(&conn)?;
    let totals = query_totals(&conn)?;

    let entries: Vec<HeapEntry> = query_top_heap(&conn, limit, filter)?
        .into_iter()
        .filter(|e| percent_of(e.alloc_bytes, totals.alloc_bytes) >= threshold)
        .collect();

    if entries.is_empty() && !json && !csv {
        eprintln!("No allocation samples found. Recording needs:");
        eprintln!("  - The profiling allocator installed (cmemprof_trace::profiler!())");
        eprintln!("  - A sampling rate small enough for the workload");
        return Ok(());
    }

    if json {
        print_heap_json(file, &summary, &totals, &entries);
    } else if csv {
        print_heap_csv(&totals, &entries);
    } else {
        print_heap_table(file, &summary, &totals, &entries);
    }

    Ok(())
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn print_heap_table(file: &Path, summary: &ProfileSummary, totals: &Totals, entries: &[HeapEntry]) {
    println!("# {}", file.display());
    let secs = summary.duration_ms / 1000;
    println!(
        "# Duration: {}m{:02}s | Rate: {} ({}) | Samples: {} | Allocs: ~{} | Total: ~{}",
        secs / 60,
        secs % 60,
        summary.sampling_rate,
        summary.policy,
        format_count(summary.sample_count),
        format_count(totals.alloc_count),
        format_bytes(totals.alloc_bytes)
    );
    if summary.overwritten > 0 {
        println!("# Overwritten: {} samples lost", summary.overwritten);
    }
    println!();

    println!(
        "{:>6}  {:>10}  {:>12}  {:<30}  FUNCTION",
        "SIZE%", "SIZE", "CALLS", "LOCATION"
    );
    println!("{}", "-".repeat(88));

    for entry in entries {
        let location = format_location(&entry.file, entry.line);
        let function = format_function(&entry.function);
        let calls = format!("{} calls", format_count(entry.alloc_count));
        println!(
            "{:>5.1}%  {:>10}  {:>12}  {:<30}  {}",
            percent_of(entry.alloc_bytes, totals.alloc_bytes),
            format_bytes(entry.alloc_bytes),
            calls,
            location,
            function
        );
    }
}

fn print_heap_json(file: &Path, summary: &ProfileSummary, totals: &Totals, entries: &[HeapEntry]) {
    println!("{{");
    println!("  \"file\": \"{}\",", escape_json(&file.display().to_string()));
    println!("  \"duration_ms\": {},", summary.duration_ms);
    println!("  \"sampling_rate\": {},", summary.sampling_rate);
    println!("  \"policy\": \"{}\",", summary.policy);
    println!("  \"samples\": {},", summary.sample_count);
    println!("  \"overwritten\": {},", summary.overwritten);
    println!("  \"total_bytes\": {},", totals.alloc_bytes);
    println!("  \"total_count\": {},", totals.alloc_count);
    println!("  \"entries\": [");

    for (i, entry) in entries.iter().enumerate() {
        let comma = if i + 1 < entries.len() { "," } else { "" };
        println!(
            "    {{ \"bytes_pct\": {:.1}, \"alloc_bytes\": {}, \"alloc_count\": {}, \"samples\": {}, \"file\": \"{}\", \"line\": {}, \"function\": \"{}\" }}{}",
            percent_of(entry.alloc_bytes, totals.alloc_bytes),
            entry.alloc_bytes,
            entry.alloc_count,
            entry.samples,
            escape_json(&entry.file),
            entry.line,
            escape_json(&entry.function),
            comma
        );
    }

    println!("  ]");
    println!("}}");
}

fn print_heap_csv(totals: &Totals, entries: &[HeapEntry]) {
    println!("bytes_pct,alloc_bytes,alloc_count,samples,file,line,function");
    for entry in entries {
        println!(
            "{:.1},{},{},{},{},{},{}",
            percent_of(entry.alloc_bytes, totals.alloc_bytes),
            entry.alloc_bytes,
            entry.alloc_count,
            entry.samples,
            csv_field(&entry.file),
            entry.line,
            csv_field(&entry.function)
        );
    }
}

/// Quoted CSV field, embedded quotes doubled
fn csv_field(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn format_location(file: &str, line: u32) -> String {
    if line > 0 {
        format!("{}:{}", file, line)
    } else {
        file.to_string()
    }
}

/// Human-readable bytes (heaptrack style)
fn format_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if b >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2}G", b / (1024.0 * 1024.0 * 1024.0))
    } else if b >= 1024.0 * 1024.0 {
        format!("{:.2}M", b / (1024.0 * 1024.0))
    } else if b >= 1024.0 {
        format!("{:.1}K", b / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

/// Format a number with commas for readability
fn format_count(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Drop the symbol hash and shorten trait impl paths
fn format_function(func: &str) -> String {
    let mut result = func.to_string();

    // "::h1234567890abcdef"
    if let Some(idx) = result.rfind("::h") {
        let suffix = &result[idx + 3..];
        if suffix.len() == 16 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            result.truncate(idx);
        }
    }

    // <path::to::Type as path::to::Trait>::method -> to::Type::method
    if result.starts_with('<')
        && let Some(as_pos) = result.find(" as ")
        && let Some(gt_pos) = result.find(">::")
        && as_pos < gt_pos
    {
        let impl_type = &result[1..as_pos];
        let method = &result[gt_pos + 3..];
        result = format!("{}::{}", simplify_type_path(impl_type), method);
    }

    result
}

/// Last two path components: module::Type
fn simplify_type_path(path: &str) -> String {
    let parts: Vec<&str> = path.split("::").collect();
    if parts.len() >= 2 {
        format!("{}::{}", parts[parts.len() - 2], parts[parts.len() - 1])
    } else {
        path.to_string()
    }
}
