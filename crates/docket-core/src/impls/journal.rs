//! Append-only JSON-lines journal.
//!
//! One record per line. A crash can leave a half-written last line; `open`
//! drops it (and truncates the file back to the last complete record) so the
//! next append starts on a clean line. A bad line anywhere else is corruption.
//!
//! A failed append is rolled back to the last complete record while the
//! process is still alive, so a torn fragment never ends up mid-file. If the
//! rollback itself fails the journal refuses further writes.
//!
//! Owners compact the journal with `rewrite`, which swaps in a file holding
//! only the records still needed.

use std::ffi::OsString;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::error::JournalError;

/// Journals shorter than this are never compacted at runtime.
const COMPACT_MIN_LINES: usize = 1024;
/// Compact once the journal holds this many lines per live record.
const COMPACT_RATIO: usize = 4;

pub struct Journal<T> {
    path: PathBuf,
    file: File,
    /// Byte length of the complete records on disk.
    len: u64,
    lines: usize,
    poisoned: bool,
    _record: PhantomData<fn(T)>,
}

impl<T> Journal<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open (or create) the journal at `path` and return the records it holds.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<T>), JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (records, valid_len) = replay::<T>(&path, &text)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if valid_len < text.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = text.len() - valid_len,
                "dropping torn journal tail"
            );
            file.set_len(valid_len as u64).await?;
        }

        Ok((
            Self {
                path,
                file,
                len: valid_len as u64,
                lines: records.len(),
                poisoned: false,
                _record: PhantomData,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records currently on disk.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Whether the journal has grown far enough past `live` records to be
    /// worth rewriting.
    pub fn wants_compaction(&self, live: usize) -> bool {
        self.lines > COMPACT_MIN_LINES.max(live.saturating_mul(COMPACT_RATIO))
    }

    /// Append one record and flush it to disk before returning.
    pub async fn append(&mut self, record: &T) -> Result<(), JournalError> {
        if self.poisoned {
            return Err(JournalError::Poisoned {
                path: self.path.display().to_string(),
            });
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        if let Err(e) = self.write_line(&line).await {
            self.roll_back().await;
            return Err(e.into());
        }
        self.len += line.len() as u64;
        self.lines += 1;
        Ok(())
    }

    /// Replace the whole journal with `records`.
    ///
    /// The new content is written and synced to a sibling file which is then
    /// renamed over the journal, so a crash leaves either the old or the new
    /// journal intact.
    pub async fn rewrite<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a T>,
    ) -> Result<(), JournalError>
    where
        T: 'a,
    {
        let mut buf = Vec::new();
        let mut lines = 0;
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
            lines += 1;
        }

        let tmp = self.compact_path();
        match tokio::fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // rename 後もこのハンドルは新しい journal を指す
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&tmp)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            path = %self.path.display(),
            before = self.lines,
            after = lines,
            "journal rewritten"
        );
        self.file = file;
        self.len = buf.len() as u64;
        self.lines = lines;
        self.poisoned = false;
        Ok(())
    }

    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Cut the file back to the last complete record.
    async fn roll_back(&mut self) {
        match self.file.set_len(self.len).await {
            Ok(()) => warn!(
                path = %self.path.display(),
                len = self.len,
                "rolled back a failed journal append"
            ),
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "could not roll back a failed journal append"
                );
                self.poisoned = true;
            }
        }
    }

    fn compact_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".compact");
        PathBuf::from(name)
    }
}

/// Parse every complete line. Returns the records and the byte length of
/// the valid prefix.
fn replay<T: DeserializeOwned>(path: &Path, text: &str) -> Result<(Vec<T>, usize), JournalError> {
    let mut records = Vec::new();
    let mut offset = 0;
    for (index, raw) in text.split_inclusive('\n').enumerate() {
        // 改行で終わらない行は append が完了していない（最終行にしか現れない）
        let Some(line) = raw.strip_suffix('\n') else {
            break;
        };
        if !line.trim().is_empty() {
            let record = serde_json::from_str::<T>(line).map_err(|source| {
                JournalError::Corrupt {
                    path: path.display().to_string(),
                    line: index + 1,
                    source,
                }
            })?;
            records.push(record);
        }
        offset += raw.len();
    }

    Ok((records, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        n: u32,
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");

        let (mut journal, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert!(records.is_empty());
        journal.append(&Rec { n: 1 }).await.unwrap();
        journal.append(&Rec { n: 2 }).await.unwrap();
        drop(journal);

        let (_, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }]);
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        tokio::fs::write(&path, "{\"n\":1}\n{\"n\":").await.unwrap();

        let (mut journal, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert_eq!(records, vec![Rec { n: 1 }]);
        journal.append(&Rec { n: 3 }).await.unwrap();
        drop(journal);

        let (_, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 3 }]);
    }

    #[tokio::test]
    async fn garbage_in_the_middle_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        tokio::fs::write(&path, "{\"n\":1}\nnot json\n{\"n\":2}\n")
            .await
            .unwrap();

        let err = Journal::<Rec>::open(&path).await.err().unwrap();
        assert!(matches!(err, JournalError::Corrupt { line: 2, .. }));
    }

    #[tokio::test]
    async fn failed_append_leaves_no_fragment_behind() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let (mut journal, _) = Journal::<Rec>::open(&path).await.unwrap();
        journal.append(&Rec { n: 1 }).await.unwrap();

        // 書き込みが途中で失敗した状態を再現する
        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"n\":").unwrap();
        drop(raw);
        journal.roll_back().await;
        assert!(!journal.poisoned);

        journal.append(&Rec { n: 2 }).await.unwrap();
        journal.append(&Rec { n: 3 }).await.unwrap();
        drop(journal);

        let (_, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert_eq!(records, vec![Rec { n: 1 }, Rec { n: 2 }, Rec { n: 3 }]);
    }

    #[tokio::test]
    async fn poisoned_journal_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let (mut journal, _) = Journal::<Rec>::open(&path).await.unwrap();
        journal.poisoned = true;

        let err = journal.append(&Rec { n: 1 }).await.unwrap_err();
        assert!(matches!(err, JournalError::Poisoned { .. }));
        drop(journal);

        let (_, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn rewrite_replaces_content_and_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.jsonl");
        let (mut journal, _) = Journal::<Rec>::open(&path).await.unwrap();
        for n in 1..=5 {
            journal.append(&Rec { n }).await.unwrap();
        }
        assert_eq!(journal.lines(), 5);

        journal.rewrite(&[Rec { n: 5 }]).await.unwrap();
        assert_eq!(journal.lines(), 1);
        journal.append(&Rec { n: 6 }).await.unwrap();
        drop(journal);

        let (journal, records) = Journal::<Rec>::open(&path).await.unwrap();
        assert_eq!(records, vec![Rec { n: 5 }, Rec { n: 6 }]);
        assert_eq!(journal.lines(), 2);
        assert!(!journal.compact_path().exists());
    }

    #[tokio::test]
    async fn compaction_waits_for_real_growth() {
        let dir = tempfile::tempdir().unwrap();
        let (mut journal, _) = Journal::<Rec>::open(dir.path().join("j.jsonl")).await.unwrap();

        journal.lines = COMPACT_MIN_LINES;
        assert!(!journal.wants_compaction(1));
        journal.lines = COMPACT_MIN_LINES + 1;
        assert!(journal.wants_compaction(1));
        assert!(!journal.wants_compaction(COMPACT_MIN_LINES));
    }
}
