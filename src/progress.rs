//! Connector sync progress.
//!
//! `bv sync` reports which connector is fetching, how many fetched items have
//! gone through ingestion, and a per-connector summary. Progress goes to
//! **stderr** so the JSON result on stdout stays parseable.

use std::io::Write;

/// A single progress event for sync.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncProgressEvent {
    /// Connector is fetching updates. Total unknown.
    Discovering { connector: String },
    /// `n` of `total` fetched items have been through ingestion.
    Ingesting {
        connector: String,
        n: u64,
        total: u64,
    },
    /// Connector finished.
    Done {
        connector: String,
        fetched: u64,
        ingested: u64,
    },
}

pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// "sync notes:inbox  ingesting  12 / 1,040 items"
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { connector } => {
                format!("sync {}  fetching...\n", connector)
            }
            SyncProgressEvent::Ingesting {
                connector,
                n,
                total,
            } => format!(
                "sync {}  ingesting  {} / {} items\n",
                connector,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Done {
                connector,
                fetched,
                ingested,
            } => format!(
                "sync {}  done  {} fetched, {} ingested\n",
                connector,
                format_number(*fetched),
                format_number(*ingested)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { connector } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "fetching"
            }),
            SyncProgressEvent::Ingesting {
                connector,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Done {
                connector,
                fetched,
                ingested,
            } => serde_json::json!({
                "event": "done",
                "connector": connector,
                "fetched": fetched,
                "ingested": ingested
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    struct Recorder(Mutex<Vec<SyncProgressEvent>>);

    impl SyncProgressReporter for Recorder {
        fn report(&self, event: SyncProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn reporters_are_object_safe() {
        let rec = Recorder(Mutex::new(Vec::new()));
        let dyn_rec: &dyn SyncProgressReporter = &rec;
        dyn_rec.report(SyncProgressEvent::Discovering {
            connector: "notes:a".to_string(),
        });
        assert_eq!(rec.0.lock().unwrap().len(), 1);
        ProgressMode::Off.reporter().report(SyncProgressEvent::Discovering {
            connector: "x".to_string(),
        });
    }
}
