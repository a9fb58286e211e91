fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_string_var<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_var<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_var<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Colon-separated list; empty segments are dropped and `~` is expanded.
fn parse_watch_dirs(value: &str, home: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for segment in value.split(':') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let path = expand_with_home(segment, home);
        if !dirs.contains(&path) {
            dirs.push(path);
        }
    }
    dirs
}

fn default_watch_dirs(home: &Path) -> Vec<PathBuf> {
    let candidates = [
        home.join("DCIM"),
        dirs::picture_dir().unwrap_or_else(|| home.join("Pictures")),
        dirs::download_dir().unwrap_or_else(|| home.join("Downloads")),
    ];
    let mut roots = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !roots.contains(&candidate) {
            roots.push(candidate);
        }
    }
    roots
}

fn format_millis(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_string();
    }
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

fn log_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::ImageQueued { path } => info!(path = %path, "image queued"),
        PipelineEvent::Analyzed {
            path,
            outcome: Ok(report),
        } => info!(
            path = %path,
            foods = report.foods.len(),
            calories = report.total.calories,
            confidence = ?report.confidence,
            "image analyzed"
        ),
        PipelineEvent::Analyzed {
            path,
            outcome: Err(err),
        } => warn!(path = %path, error = %err, "image analysis failed"),
        PipelineEvent::Synced {
            user_id,
            path,
            success: true,
        } => info!(user_id = %user_id, path = %path, "analysis synced"),
        PipelineEvent::Synced {
            user_id,
            path,
            success: false,
        } => warn!(user_id = %user_id, path = %path, "analysis sync failed, queued for retry"),
        PipelineEvent::RetryDiscarded {
            user_id,
            path,
            attempts,
        } => error!(
            user_id = %user_id,
            path = %path,
            attempts,
            "analysis dropped after exhausting retries"
        ),
    }
}
