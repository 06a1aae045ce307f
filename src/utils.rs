// ABOUTME: Shared helpers for identifier quoting, statement splitting and formatting
// ABOUTME: Provides retry logic, checksums, and human-readable byte/duration output

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Quote a MySQL identifier with backticks
///
/// Embedded backticks are doubled, which is the only escaping MySQL applies
/// inside a quoted identifier.
///
/// # Examples
///
/// ```
/// # use mysql_dumper::utils::quote_ident;
/// assert_eq!(quote_ident("users"), "`users`");
/// assert_eq!(quote_ident("we`ird"), "`we``ird`");
/// ```
pub fn quote_ident(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

/// Split a comma-separated list, trimming entries and dropping empty ones
///
/// # Examples
///
/// ```
/// # use mysql_dumper::utils::split_list;
/// assert_eq!(split_list(" db1, db2 ,,"), vec!["db1", "db2"]);
/// assert!(split_list("").is_empty());
/// ```
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a dump file into executable statements
///
/// Statements are delimited by `;\n`. Blank fragments and fragments that start
/// with `/*` (versioned comments emitted by `mysqldump`-style tools) are dropped.
/// Works on bytes because data files may carry non-UTF-8 string literals.
pub fn split_statements(content: &[u8]) -> Vec<&[u8]> {
    let mut statements = Vec::new();
    let mut rest = content;
    loop {
        let (fragment, tail) = match find_delimiter(rest) {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 2..])),
            None => (rest, None),
        };
        let stmt = trim_ascii_whitespace(fragment);
        if !stmt.is_empty() && !stmt.starts_with(b"/*") {
            statements.push(stmt);
        }
        match tail {
            Some(tail) => rest = tail,
            None => break,
        }
    }
    statements
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|window| window == b";\n")
}

/// Strip leading and trailing ASCII whitespace from a byte slice
///
/// # Examples
///
/// ```
/// # use mysql_dumper::utils::trim_ascii_whitespace;
/// assert_eq!(trim_ascii_whitespace(b"  USE `a`;\n"), b"USE `a`;");
/// assert!(trim_ascii_whitespace(b" \n\t").is_empty());
/// ```
pub fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

/// Hex-encoded SHA-256 digest of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay (exponential backoff) to ride out transient network failures.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use mysql_dumper::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("success") },
///     3,
///     Duration::from_millis(200),
///     "connect",
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
    label: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {:#}, retrying in {:?}...",
                        label,
                        attempt + 1,
                        max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{} failed after retries", label)))
}

/// Format bytes into human-readable string
///
/// Converts byte count into appropriate units (B, KB, MB, GB, TB)
/// with one decimal place of precision.
///
/// # Examples
///
/// ```
/// # use mysql_dumper::utils::format_bytes;
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1536), "1.5 KB");
/// assert_eq!(format_bytes(1073741824), "1.0 GB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_idx])
}

/// Format an elapsed duration as seconds, minutes or hours
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use mysql_dumper::utils::format_duration;
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
/// assert_eq!(format_duration(Duration::from_secs(150)), "2.5m");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();

    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Throughput in MB/s, zero when no time has elapsed
pub fn megabytes_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / 1024.0 / 1024.0) / secs
    } else {
        0.0
    }
}
