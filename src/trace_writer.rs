use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

/// One match trace destined for a per-project log file.
pub struct TraceEntry {
    pub project: String,
    pub line: String,
}

pub type TraceSender = mpsc::UnboundedSender<TraceEntry>;

pub fn create_trace_channel() -> (TraceSender, mpsc::UnboundedReceiver<TraceEntry>) {
    mpsc::unbounded_channel()
}

/// Drain the trace channel into `{logs_dir}/{project}.log`, batching
/// writes and flushing every 64 entries or 500 ms.
pub async fn run_trace_writer(logs_dir: PathBuf, mut rx: mpsc::UnboundedReceiver<TraceEntry>) {
    if let Err(e) = std::fs::create_dir_all(&logs_dir) {
        log::error!("cannot create {}: {}; traces disabled", logs_dir.display(), e);
        return;
    }

    let mut writers: HashMap<String, BufWriter<File>> = HashMap::new();
    let mut count = 0u32;

    loop {
        let entry = tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => entry,
                    None => break, // channel closed
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                for w in writers.values_mut() {
                    let _ = w.flush();
                }
                count = 0;
                continue;
            }
        };

        let writer = match writer_for(&mut writers, &logs_dir, &entry.project) {
            Some(writer) => writer,
            None => continue,
        };

        let _ = writer.write_all(entry.line.as_bytes());
        let _ = writer.write_all(b"\n");
        count += 1;

        if count >= 64 {
            for w in writers.values_mut() {
                let _ = w.flush();
            }
            count = 0;
        }
    }

    // Final flush on shutdown
    for w in writers.values_mut() {
        let _ = w.flush();
    }
}

fn writer_for<'a>(
    writers: &'a mut HashMap<String, BufWriter<File>>,
    logs_dir: &Path,
    project: &str,
) -> Option<&'a mut BufWriter<File>> {
    if !writers.contains_key(project) {
        // Project names are folder names; anything else stays out of the
        // log path.
        if project.contains(['/', '\\']) || project.is_empty() {
            return None;
        }
        let path = logs_dir.join(format!("{}.log", project));
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("cannot open trace log {}: {}", path.display(), e);
                return None;
            }
        };
        writers.insert(
            project.to_string(),
            BufWriter::with_capacity(8192, file),
        );
    }
    writers.get_mut(project)
}
