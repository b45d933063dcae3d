// Streams line-oriented job output into size-bounded page files.
// Each page is capped at `PAGE_SIZE` bytes; when a page fills up, it is
// closed, handed to the upload queue, and a new page file is started.

use crate::job_server_queue::{JobServerQueue, CUSTOM_TOOL_LOG_NAME, TIMELINE_LOG_FILE_TYPE};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Folder name for log pages under the diag directory.
pub const PAGING_FOLDER: &str = "pages";

/// Maximum size of a single log page in bytes (8 MiB).
pub const PAGE_SIZE: usize = 8 * 1024 * 1024;

/// Marker that opens a console group.
pub const GROUP_START: &str = "##[group]";

/// Marker that closes a console group. The console renders the closing
/// marker as an empty line, so a matched pair counts as a single line.
pub const GROUP_END: &str = "##[endgroup]";

/// A logger that writes timestamped output to paged log files on disk.
///
/// Not safe for concurrent writes; callers use one instance per timeline
/// record and serialize writes to it. Closed pages are enqueued to the
/// `JobServerQueue` exactly once, in the order they are closed.
pub struct PagingLogger {
    job_server_queue: Arc<dyn JobServerQueue>,

    timeline_id: Uuid,
    timeline_record_id: Uuid,

    /// Page id shared by all pages of this logger instance.
    page_id: Uuid,
    /// Pages directory.
    pages_folder: PathBuf,
    /// Current page writer; `None` until the first write and between pages.
    page_writer: Option<BufWriter<File>>,
    /// Current page file path. Taken exactly once per page on close.
    page_data_file: Option<PathBuf>,
    /// Byte count in the current page. Resets on rollover.
    page_byte_count: usize,
    /// 1-based page counter. Cumulative across rollovers.
    page_count: u32,

    /// Total lines written across all pages.
    total_lines: u64,
    /// Whether a `##[group]` is currently open.
    group_open: bool,
}

impl PagingLogger {
    /// Create a new `PagingLogger` writing under the given diag directory.
    ///
    /// No file or directory is touched until the first [`write`](Self::write).
    pub fn new(diag_directory: &Path, job_server_queue: Arc<dyn JobServerQueue>) -> Self {
        Self {
            job_server_queue,
            timeline_id: Uuid::nil(),
            timeline_record_id: Uuid::nil(),
            page_id: Uuid::new_v4(),
            pages_folder: diag_directory.join(PAGING_FOLDER),
            page_writer: None,
            page_data_file: None,
            page_byte_count: 0,
            page_count: 0,
            total_lines: 0,
            group_open: false,
        }
    }

    /// Associate subsequent writes with a timeline record.
    pub fn setup(&mut self, timeline_id: Uuid, timeline_record_id: Uuid) {
        self.timeline_id = timeline_id;
        self.timeline_record_id = timeline_record_id;
    }

    /// Get the total number of lines written.
    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    /// Write a message to the log, prefixed with a UTC timestamp.
    pub fn write(&mut self, message: &str) {
        // Lazy creation on first write
        if self.page_writer.is_none() {
            self.new_page();
        }

        let line = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.7fZ"), message);

        if let Some(ref mut writer) = self.page_writer {
            let _ = writeln!(writer, "{}", line);
        }

        // One line per call, plus one per embedded newline.
        self.total_lines += 1;
        self.total_lines += message.chars().filter(|&c| c == '\n').count() as u64;

        // A matched group start/end pair renders as one line: the closing
        // marker becomes an empty line, so it is subtracted back out.
        // An unmatched end marker stays a normal line.
        if message.contains(GROUP_START) {
            self.group_open = true;
        } else if message.contains(GROUP_END) && self.group_open {
            self.group_open = false;
            self.total_lines -= 1;
        }

        self.page_byte_count += line.len() + 1; // +1 for the newline

        if self.page_byte_count >= PAGE_SIZE {
            self.new_page();
        }
    }

    /// Finalize the logger, flushing and closing the current page if any.
    ///
    /// Idempotent, and safe in any order with `Drop`.
    pub fn end(&mut self) {
        self.end_page();
    }

    /// Start a new page file, closing the previous one first.
    fn new_page(&mut self) {
        self.end_page();
        self.page_byte_count = 0;
        self.page_count += 1;

        let file_name = format!("{}_{}.log", self.page_id, self.page_count);
        let path = self.pages_folder.join(&file_name);

        if let Err(e) = fs::create_dir_all(&self.pages_folder) {
            tracing::error!("Failed to create pages folder {:?}: {}", self.pages_folder, e);
            return;
        }

        match File::create(&path) {
            Ok(file) => {
                self.page_writer = Some(BufWriter::new(file));
                self.page_data_file = Some(path);
            }
            Err(e) => {
                tracing::error!("Failed to create page file {:?}: {}", path, e);
            }
        }
    }

    /// Close and enqueue the current page.
    ///
    /// `Option::take` is the single-fire guard here: the writer can only be
    /// flushed once and the path can only be enqueued once, no matter how
    /// many times `end` and `Drop` run or in which order.
    fn end_page(&mut self) {
        if let Some(mut writer) = self.page_writer.take() {
            let _ = writer.flush();
        }
        if let Some(path) = self.page_data_file.take() {
            self.job_server_queue.queue_file_upload(
                self.timeline_id,
                self.timeline_record_id,
                TIMELINE_LOG_FILE_TYPE,
                CUSTOM_TOOL_LOG_NAME,
                &path,
                true,
            );
        }
    }
}

impl Drop for PagingLogger {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Queue double that records every enqueued page.
    #[derive(Default)]
    struct RecordingQueue {
        uploads: Mutex<Vec<(Uuid, Uuid, String, String, PathBuf, bool)>>,
    }

    impl RecordingQueue {
        fn paths(&self) -> Vec<PathBuf> {
            self.uploads.lock().iter().map(|u| u.4.clone()).collect()
        }
    }

    impl JobServerQueue for RecordingQueue {
        fn queue_file_upload(
            &self,
            timeline_id: Uuid,
            timeline_record_id: Uuid,
            file_type: &str,
            name: &str,
            path: &Path,
            delete_source: bool,
        ) {
            self.uploads.lock().push((
                timeline_id,
                timeline_record_id,
                file_type.to_string(),
                name.to_string(),
                path.to_path_buf(),
                delete_source,
            ));
        }
    }

    fn new_logger(dir: &TempDir) -> (PagingLogger, Arc<RecordingQueue>) {
        let queue = Arc::new(RecordingQueue::default());
        let mut logger = PagingLogger::new(dir.path(), queue.clone());
        logger.setup(Uuid::new_v4(), Uuid::new_v4());
        (logger, queue)
    }

    #[test]
    fn no_files_before_first_write() {
        let dir = TempDir::new().unwrap();
        let (logger, queue) = new_logger(&dir);
        assert!(!dir.path().join(PAGING_FOLDER).exists());
        drop(logger);
        assert!(queue.paths().is_empty());
    }

    #[test]
    fn lines_are_timestamped_utf8_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);
        logger.write("building target //src:all");
        logger.end();

        let paths = queue.paths();
        assert_eq!(paths.len(), 1);
        let content = std::fs::read_to_string(&paths[0]).unwrap();
        assert!(content.ends_with("building target //src:all\n"));
        // ISO-8601 UTC prefix, space separated.
        let (stamp, rest) = content.split_once(' ').unwrap();
        assert!(stamp.ends_with('Z'));
        assert!(stamp.contains('T'));
        assert_eq!(rest, "building target //src:all\n");
    }

    #[test]
    fn page_descriptor_matches_upload_contract() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(RecordingQueue::default());
        let timeline = Uuid::new_v4();
        let record = Uuid::new_v4();
        let mut logger = PagingLogger::new(dir.path(), queue.clone());
        logger.setup(timeline, record);
        logger.write("hello");
        logger.end();

        let uploads = queue.uploads.lock();
        assert_eq!(uploads.len(), 1);
        let (tid, rid, file_type, name, path, delete_source) = &uploads[0];
        assert_eq!(*tid, timeline);
        assert_eq!(*rid, record);
        assert_eq!(file_type, TIMELINE_LOG_FILE_TYPE);
        assert_eq!(name, CUSTOM_TOOL_LOG_NAME);
        assert!(*delete_source);
        assert!(path.starts_with(dir.path().join(PAGING_FOLDER)));
    }

    #[test]
    fn page_names_share_instance_id_with_increasing_sequence() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);

        // ~10 KiB per line forces a rollover before 1000 lines.
        let chunk = "x".repeat(10 * 1024);
        for _ in 0..1000 {
            logger.write(&chunk);
        }
        logger.end();

        let paths = queue.paths();
        assert_eq!(paths.len(), 2);

        let name = |p: &PathBuf| p.file_name().unwrap().to_str().unwrap().to_string();
        let (prefix1, seq1) = name(&paths[0]).rsplit_once('_').map(|(a, b)| (a.to_string(), b.to_string())).unwrap();
        let (prefix2, seq2) = name(&paths[1]).rsplit_once('_').map(|(a, b)| (a.to_string(), b.to_string())).unwrap();
        assert_eq!(prefix1, prefix2);
        assert_eq!(seq1, "1.log");
        assert_eq!(seq2, "2.log");
    }

    #[test]
    fn rollover_at_eight_mebibytes() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);

        let chunk = "x".repeat(10 * 1024);
        for _ in 0..1000 {
            logger.write(&chunk);
        }
        logger.end();

        // ~10 MB of output lands in two pages; line count is cumulative.
        let paths = queue.paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(logger.total_lines(), 1000);

        // The first page closed at the write that crossed the threshold, so
        // it may exceed 8 MiB by at most one line's worth of bytes.
        let first_len = std::fs::metadata(&paths[0]).unwrap().len() as usize;
        assert!(first_len >= PAGE_SIZE);
        assert!(first_len < PAGE_SIZE + chunk.len() + 64);

        // No bytes are lost across the rollover.
        let second_len = std::fs::metadata(&paths[1]).unwrap().len() as usize;
        let total: usize = first_len + second_len;
        // 1000 lines, each chunk + timestamp (28 chars) + separator + newline.
        assert_eq!(total, 1000 * (chunk.len() + 30));
    }

    #[test]
    fn total_lines_counts_embedded_newlines() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _queue) = new_logger(&dir);
        logger.write("one\ntwo\nthree");
        assert_eq!(logger.total_lines(), 3);
        logger.write("four");
        assert_eq!(logger.total_lines(), 4);
    }

    #[test]
    fn matched_group_counts_as_single_line() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _queue) = new_logger(&dir);
        logger.write("##[group]Restore dependencies");
        logger.write("##[endgroup]");
        assert_eq!(logger.total_lines(), 1);
    }

    #[test]
    fn unmatched_endgroup_is_a_normal_line() {
        let dir = TempDir::new().unwrap();
        let (mut logger, _queue) = new_logger(&dir);
        logger.write("##[endgroup]");
        assert_eq!(logger.total_lines(), 1);

        // A second end marker after the pair closed is normal again.
        logger.write("##[group]g");
        logger.write("##[endgroup]");
        logger.write("##[endgroup]");
        assert_eq!(logger.total_lines(), 3);
    }

    #[test]
    fn end_is_idempotent_and_safe_with_drop() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);
        logger.write("only line");

        logger.end();
        logger.end();
        logger.end();
        drop(logger);

        // One page, enqueued exactly once.
        assert_eq!(queue.paths().len(), 1);
    }

    #[test]
    fn end_without_writes_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);
        logger.end();
        drop(logger);
        assert!(queue.paths().is_empty());
    }

    #[test]
    fn pages_enqueued_in_close_order() {
        let dir = TempDir::new().unwrap();
        let (mut logger, queue) = new_logger(&dir);

        let chunk = "y".repeat(1024 * 1024);
        for _ in 0..20 {
            logger.write(&chunk);
        }
        logger.end();

        let paths = queue.paths();
        assert!(paths.len() >= 2);
        let seqs: Vec<u32> = paths
            .iter()
            .map(|p| {
                let name = p.file_stem().unwrap().to_str().unwrap();
                name.rsplit_once('_').unwrap().1.parse().unwrap()
            })
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }
}
