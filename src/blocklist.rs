use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const BUFFER_SIZE: usize = 256 * 1024;

/// Domain substrings whose presence in the first bytes of a tunnel triggers
/// record splitting.
///
/// Built once before the listener starts and never mutated afterwards, so
/// connection tasks share it through an `Arc` without any lock.
#[derive(Debug, Default, Clone)]
pub struct Blocklist {
    entries: Vec<Vec<u8>>,
}

impl Blocklist {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let entries = entries
            .into_iter()
            .filter(|e| !e.as_ref().is_empty())
            .map(|e| e.as_ref().to_vec())
            .collect();
        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for blacklist file: {:?}", path))?;

        if metadata.len() > MAX_FILE_SIZE {
            anyhow::bail!("blacklist file too large");
        }

        let file = File::open(path)
            .with_context(|| format!("Failed to open blacklist file: {:?}", path))?;
        let reader = BufReader::with_capacity(BUFFER_SIZE, file);

        let mut entries = Vec::new();
        let mut raw_count = 0;

        // Raw bytes, no UTF-8 decoding: entries are matched byte for byte.
        for line in reader.split(b'\n') {
            let line = line.with_context(|| format!("Failed to read blacklist file: {:?}", path))?;
            raw_count += 1;

            let line = line.strip_suffix(b"\r").unwrap_or(&line);
            if !line.is_empty() {
                entries.push(line.to_vec());
            }
        }

        let blocklist = Self::from_entries(entries);

        info!(
            "Loaded blacklist: {} entries from {} lines",
            blocklist.len(),
            raw_count
        );

        Ok(blocklist)
    }

    /// Startup variant of [`Blocklist::load`]: an unreadable source is not
    /// fatal, the proxy just never fragments.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        match Self::load(path.as_ref()) {
            Ok(blocklist) => blocklist,
            Err(e) => {
                warn!("Blacklist unavailable, fragmentation disabled: {:#}", e);
                Self::default()
            }
        }
    }

    /// Raw, case-sensitive substring search. Stops at the first entry found.
    pub fn matches(&self, payload: &[u8]) -> bool {
        self.entries
            .iter()
            .any(|needle| contains(payload, needle))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}
