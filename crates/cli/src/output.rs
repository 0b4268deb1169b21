//! Output formatting for match results

use anyhow::Result;
use std::collections::BTreeMap;
use std::time::Duration;

use servprobe_common::{MatchResult, PortState};

/// Print match results in the specified format
pub fn print_results(results: &[MatchResult], format: &str, elapsed: Duration) -> Result<()> {
    let format = format.trim().to_lowercase();
    match format.as_str() {
        "json" | "j" => println!("{}", render_json(results, elapsed)?),
        "csv" | "c" => print!("{}", render_csv(results)),
        "table" | "text" | "t" | "" => print_table(results, elapsed),
        _ => {
            eprintln!("Warning: Unknown format '{}', using default table format", format);
            print_table(results, elapsed);
        }
    }
    Ok(())
}

fn sorted(results: &[MatchResult]) -> Vec<&MatchResult> {
    let mut sorted: Vec<&MatchResult> = results.iter().collect();
    sorted.sort_by(|a, b| a.target.cmp(&b.target).then_with(|| a.port.cmp(&b.port)));
    sorted
}

/// Open ports as a table, closed and unknown ones only counted.
fn print_table(results: &[MatchResult], elapsed: Duration) {
    if results.is_empty() {
        println!("\nNo results to display.\n");
        return;
    }

    println!("\n{:-<80}", "");
    println!("{:<24} {:<8} {:<10} {:<36}", "HOST", "PORT", "STATE", "SERVICE/VERSION");
    println!("{:-<80}", "");

    let (mut open, mut closed, mut unknown) = (0usize, 0usize, 0usize);
    for result in sorted(results) {
        match result.state {
            PortState::Open => {
                println!(
                    "{:<24} {:<8} {:<10} {:<36}",
                    result.target,
                    result.port,
                    result.state,
                    service_display(result)
                );
                open += 1;
            }
            PortState::Closed => closed += 1,
            PortState::Unknown => unknown += 1,
        }
    }

    println!("{:-<80}", "");
    println!("\nSummary:");
    println!("  Total matched: {}", results.len());
    println!("  Open: {}", open);
    println!("  Closed: {}", closed);
    println!("  Unknown: {}", unknown);
    println!("  Duration: {}", format_duration(elapsed));
    println!();
}

fn render_json(results: &[MatchResult], elapsed: Duration) -> Result<String> {
    use serde_json::json;

    let mut by_target: BTreeMap<&str, Vec<serde_json::Value>> = BTreeMap::new();
    for result in sorted(results) {
        by_target
            .entry(result.target.as_str())
            .or_default()
            .push(serde_json::to_value(result)?);
    }

    let output = json!({
        "match_info": {
            "duration_seconds": elapsed.as_secs_f64(),
            "duration_formatted": format_duration(elapsed),
            "total_targets": by_target.len(),
            "total_matched": results.len()
        },
        "results": by_target
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

fn render_csv(results: &[MatchResult]) -> String {
    let mut out = String::from("host,port,state,service,product,version,cpes,reason\n");
    for result in sorted(results) {
        let info = result.fingerprint.as_ref();
        let field = |f: fn(&servprobe_common::FingerprintInfo) -> String| {
            csv_quote(&info.map(f).unwrap_or_default())
        };
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            result.target,
            result.port,
            result.state,
            field(|i| i.service_name.clone()),
            field(|i| i.product_verbose.clone()),
            field(|i| i.version.clone()),
            field(|i| i.cpes.join(" ")),
            csv_quote(&result.reason),
        ));
    }
    out
}

fn csv_quote(value: &str) -> String {
    let flat = value.replace('"', "\"\"").replace(['\r', '\n'], " ");
    format!("\"{}\"", flat)
}

/// service (product) version, or the first banner line when nothing matched
fn service_display(result: &MatchResult) -> String {
    let Some(info) = result.fingerprint.as_ref() else {
        return "unknown".to_string();
    };
    let display = if !info.service_name.is_empty() {
        let mut display = info.service_name.clone();
        if !info.product_verbose.is_empty() {
            display.push_str(&format!(" ({})", info.product_verbose));
        }
        if !info.version.is_empty() {
            display.push_str(&format!(" {}", info.version));
        }
        display
    } else {
        info.banner
            .lines()
            .next()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or("unknown")
            .to_string()
    };
    truncate(display, 36)
}

fn truncate(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }
    let cut: String = text.chars().take(max - 3).collect();
    format!("{cut}...")
}

/// Format duration in a human-readable way
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        format!("{}ms", millis)
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}.{:03}s", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}
