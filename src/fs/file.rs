use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, trace};

use crate::buf::{DataChunk, SharedBuf};
use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind};
use crate::token::Token;

/// File stat information: size plus access/modify/status-change times.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StatData {
    pub size: u64,
    pub atime_sec: i64,
    pub atime_nsec: i64,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
}

type OpenCallback = Box<dyn FnOnce(&mut EventLoop, File, &Error)>;
type ReadCallback = Box<dyn FnMut(&mut EventLoop, File, &DataChunk, &Error)>;
type EndReadCallback = Box<dyn FnOnce(&mut EventLoop, File)>;
type StatCallback = Box<dyn FnOnce(&mut EventLoop, File, &StatData, &Error)>;
type CloseCallback = Box<dyn FnOnce(&mut EventLoop, File, &Error)>;

/// Asynchronous file handle with a cooperative read-buffer pool.
///
/// Streaming reads draw from a fixed pool of [`READ_BUFS_NUM`] buffers of
/// [`READ_BUF_SIZE`] bytes. A delivered chunk shares its pool buffer;
/// while the user holds the chunk the buffer stays leased, and when every
/// buffer is held reads pause until one is released. The loop does not
/// exit while any buffer is outstanding.
///
/// [`READ_BUFS_NUM`]: File::READ_BUFS_NUM
/// [`READ_BUF_SIZE`]: File::READ_BUF_SIZE
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct File {
    id: HandleId,
}

pub(crate) struct FileState {
    path: PathBuf,
    file: Option<Arc<std::fs::File>>,
    // `None` while a read job on a worker thread holds the buffer.
    bufs: [Option<Arc<[u8]>>; File::READ_BUFS_NUM],
    read_callback: Option<ReadCallback>,
    end_read_callback: Option<EndReadCallback>,
    reading: bool,
    read_offset: u64,
    eof_reached: bool,
    jobs: usize,
    watch: Option<usize>,
}

impl FileState {
    fn new() -> FileState {
        FileState {
            path: PathBuf::new(),
            file: None,
            bufs: std::array::from_fn(|_| Some(Arc::from(vec![0u8; File::READ_BUF_SIZE]))),
            read_callback: None,
            end_read_callback: None,
            reading: false,
            read_offset: 0,
            eof_reached: false,
            jobs: 0,
            watch: None,
        }
    }

    fn free_buf_index(&self) -> Option<usize> {
        self.bufs
            .iter()
            .position(|buf| buf.as_ref().is_some_and(|arc| Arc::strong_count(arc) == 1))
    }

    fn outstanding_bufs(&self) -> usize {
        self.bufs
            .iter()
            .filter(|buf| match buf {
                Some(arc) => Arc::strong_count(arc) > 1,
                // Leased to a worker job.
                None => true,
            })
            .count()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.jobs > 0 || self.watch.is_some()
    }

    pub(crate) fn is_drained(&self) -> bool {
        // The watch must unhook itself before the slot can be reclaimed.
        self.jobs == 0 && self.outstanding_bufs() == 0 && self.watch.is_none()
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut FileState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::File(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&FileState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::File(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn file_at(lp: &EventLoop, token: Token) -> Option<File> {
    lp.gen_of(token).map(|gen| File {
        id: HandleId { token, gen },
    })
}

impl File {
    pub const READ_BUF_SIZE: usize = 1024 * 4;
    pub const READ_BUFS_NUM: usize = 4;

    pub fn new(lp: &mut EventLoop) -> File {
        let id = lp.allocate_handle(HandleKind::File(FileState::new()));
        File { id }
    }

    /// Opens a regular file for reading. Opening a directory fails with
    /// `IllegalOperationOnADirectory`.
    pub fn open<P, F>(&self, lp: &mut EventLoop, path: P, callback: F)
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, File, &Error) + 'static,
    {
        open_impl(lp, self.id, path.into(), Box::new(callback));
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| s.file.is_some())
    }

    pub fn path(&self, lp: &EventLoop) -> PathBuf {
        state_ref(lp, self.id).map_or_else(PathBuf::new, |s| s.path.clone())
    }

    /// Streams the file from the beginning through the buffer pool.
    /// `end_read_callback` fires once at end of file; reading again after
    /// that delivers nothing.
    pub fn read<D, E>(&self, lp: &mut EventLoop, read_callback: D, end_read_callback: E)
    where
        D: FnMut(&mut EventLoop, File, &DataChunk, &Error) + 'static,
        E: FnOnce(&mut EventLoop, File) + 'static,
    {
        read_impl(
            lp,
            self.id,
            Box::new(read_callback),
            Some(Box::new(end_read_callback)),
        );
    }

    /// Streaming read without an end-of-file notification.
    pub fn read_unbounded<D>(&self, lp: &mut EventLoop, read_callback: D)
    where
        D: FnMut(&mut EventLoop, File, &DataChunk, &Error) + 'static,
    {
        read_impl(lp, self.id, Box::new(read_callback), None);
    }

    /// Positional read of up to `bytes_count` bytes at `offset`; the
    /// callback fires exactly once, possibly with fewer bytes at EOF.
    pub fn read_block<F>(&self, lp: &mut EventLoop, offset: u64, bytes_count: usize, callback: F)
    where
        F: FnMut(&mut EventLoop, File, &DataChunk, &Error) + 'static,
    {
        read_block_impl(lp, self.id, offset, bytes_count, Box::new(callback));
    }

    pub fn stat<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop, File, &StatData, &Error) + 'static,
    {
        stat_impl(lp, self.id, Box::new(callback));
    }

    pub fn close<F>(&self, lp: &mut EventLoop, callback: F)
    where
        F: FnOnce(&mut EventLoop, File, &Error) + 'static,
    {
        close_impl(lp, self.id, Some(Box::new(callback)));
    }
}

impl Handle for File {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn open_impl(lp: &mut EventLoop, id: HandleId, path: PathBuf, callback: OpenCallback) {
    let token = id.token;
    let Some(file) = file_at(lp, token) else {
        return;
    };
    if state_ref(lp, id).is_none() {
        return;
    }

    let job_path = path.clone();
    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || open_for_reading(&job_path),
        move |lp, result| {
            bump_jobs(lp, token, -1);
            let error = match result {
                Ok(os_file) => {
                    if let Some(state) = state_mut(lp, token) {
                        state.file = Some(Arc::new(os_file));
                        state.path = path;
                        state.eof_reached = false;
                        state.read_offset = 0;
                        state.reading = false;
                    }
                    Error::ok()
                }
                Err(error) => error,
            };
            trace!("file open finished; token={:?}; error={}", token, error);
            callback(lp, file, &error);
        },
    );
}

fn open_for_reading(path: &Path) -> Result<std::fs::File, Error> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::with_context(StatusCode::from_io_error(&e), path.display().to_string()))?;
    if metadata.is_dir() {
        return Err(Error::with_context(
            StatusCode::IllegalOperationOnADirectory,
            path.display().to_string(),
        ));
    }
    std::fs::File::open(path)
        .map_err(|e| Error::with_context(StatusCode::from_io_error(&e), path.display().to_string()))
}

fn read_impl(
    lp: &mut EventLoop,
    id: HandleId,
    read_callback: ReadCallback,
    end_read_callback: Option<EndReadCallback>,
) {
    let token = id.token;
    let Some(file) = file_at(lp, token) else {
        return;
    };

    let open = state_ref(lp, id).is_some_and(|s| s.file.is_some());
    if !open {
        let mut read_callback = read_callback;
        lp.schedule_callback(move |lp| {
            read_callback(
                lp,
                file,
                &DataChunk::empty(),
                &Error::new(StatusCode::FileNotOpen),
            );
        });
        return;
    }

    {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if state.eof_reached {
            // The previous read already delivered end-of-file.
            return;
        }
        if state.reading {
            trace!("read already in progress; token={:?}", token);
            return;
        }
        state.read_callback = Some(read_callback);
        state.end_read_callback = end_read_callback;
        state.reading = true;
        state.read_offset = 0;
    }

    issue_read(lp, token);
}

/// Starts the next pooled read if a buffer is free; pauses otherwise.
fn issue_read(lp: &mut EventLoop, token: Token) {
    let leased = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        if !state.reading || state.eof_reached || state.jobs > 0 {
            return;
        }
        let Some(file) = &state.file else {
            return;
        };
        match state.free_buf_index() {
            Some(index) => {
                let Some(buf) = state.bufs[index].take() else {
                    return;
                };
                Some((index, buf, Arc::clone(file), state.read_offset))
            }
            None => None,
        }
    };

    let Some((index, mut buf, os_file, offset)) = leased else {
        // Every buffer is held by user code; resume once one is released.
        trace!("file reads paused; all read buffers in use; token={:?}", token);
        ensure_watch(lp, token);
        return;
    };

    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || {
            let result = match Arc::get_mut(&mut buf) {
                Some(slice) => os_file.read_at(slice, offset),
                // The pool lease guarantees exclusivity.
                None => Err(io::Error::from(io::ErrorKind::Other)),
            };
            (index, buf, result)
        },
        move |lp, (index, buf, result)| {
            bump_jobs(lp, token, -1);
            finish_pooled_read(lp, token, index, buf, result);
        },
    );
}

fn finish_pooled_read(
    lp: &mut EventLoop,
    token: Token,
    index: usize,
    buf: Arc<[u8]>,
    result: io::Result<usize>,
) {
    let Some(file) = file_at(lp, token) else {
        return;
    };

    // Return the lease to the pool before anything can observe the slot.
    let chunk = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.bufs[index] = Some(Arc::clone(&buf));
        match &result {
            Ok(n) if *n > 0 => {
                let chunk = DataChunk::new(SharedBuf::with_len(buf, *n), state.read_offset);
                state.read_offset += *n as u64;
                Some(chunk)
            }
            _ => None,
        }
    };

    match result {
        Ok(0) => {
            let callback = {
                let Some(state) = state_mut(lp, token) else {
                    return;
                };
                state.eof_reached = true;
                state.reading = false;
                state.read_callback = None;
                state.end_read_callback.take()
            };
            trace!("file read reached EOF; token={:?}", token);
            if let Some(callback) = callback {
                callback(lp, file);
            }
        }
        Ok(_) => {
            let Some(chunk) = chunk else {
                return;
            };
            let callback = state_mut(lp, token).and_then(|s| s.read_callback.take());
            if let Some(mut callback) = callback {
                callback(lp, file, &chunk, &Error::ok());
                if let Some(state) = state_mut(lp, token) {
                    if state.read_callback.is_none() {
                        state.read_callback = Some(callback);
                    }
                }
            }
            drop(chunk);

            // If the user kept the chunk the buffer stays leased; the
            // watch keeps the loop alive until it comes back.
            let retained = state_ref_by_token(lp, token)
                .is_some_and(|s| s.outstanding_bufs() > 0);
            if retained {
                ensure_watch(lp, token);
            }
            issue_read(lp, token);
        }
        Err(e) => {
            let callback = {
                let Some(state) = state_mut(lp, token) else {
                    return;
                };
                state.reading = false;
                state.end_read_callback = None;
                state.read_callback.take()
            };
            let error = Error::from(&e);
            if let Some(mut callback) = callback {
                callback(lp, file, &DataChunk::empty(), &error);
            }
        }
    }
}

fn read_block_impl(
    lp: &mut EventLoop,
    id: HandleId,
    offset: u64,
    bytes_count: usize,
    mut callback: ReadCallback,
) {
    let token = id.token;
    let Some(file) = file_at(lp, token) else {
        return;
    };

    let os_file = state_ref(lp, id).and_then(|s| s.file.as_ref().map(Arc::clone));
    let Some(os_file) = os_file else {
        lp.schedule_callback(move |lp| {
            callback(
                lp,
                file,
                &DataChunk::empty(),
                &Error::new(StatusCode::FileNotOpen),
            );
        });
        return;
    };

    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || {
            let mut data = vec![0u8; bytes_count];
            let mut filled = 0;
            // Partial reads are legal; keep going until EOF or done.
            while filled < bytes_count {
                match os_file.read_at(&mut data[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            data.truncate(filled);
            Ok(data)
        },
        move |lp, result| {
            bump_jobs(lp, token, -1);
            match result {
                Ok(data) => {
                    let chunk = DataChunk::new(SharedBuf::from(data), offset);
                    callback(lp, file, &chunk, &Error::ok());
                }
                Err(e) => {
                    callback(lp, file, &DataChunk::empty(), &Error::from(&e));
                }
            }
        },
    );
}

fn stat_impl(lp: &mut EventLoop, id: HandleId, callback: StatCallback) {
    let token = id.token;
    let Some(file) = file_at(lp, token) else {
        return;
    };

    let os_file = state_ref(lp, id).and_then(|s| s.file.as_ref().map(Arc::clone));
    let Some(os_file) = os_file else {
        lp.schedule_callback(move |lp| {
            callback(
                lp,
                file,
                &StatData::default(),
                &Error::new(StatusCode::FileNotOpen),
            );
        });
        return;
    };

    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || os_file.metadata(),
        move |lp, result| {
            bump_jobs(lp, token, -1);
            match result {
                Ok(metadata) => {
                    let stat = StatData {
                        size: metadata.size(),
                        atime_sec: metadata.atime(),
                        atime_nsec: metadata.atime_nsec(),
                        mtime_sec: metadata.mtime(),
                        mtime_nsec: metadata.mtime_nsec(),
                        ctime_sec: metadata.ctime(),
                        ctime_nsec: metadata.ctime_nsec(),
                    };
                    callback(lp, file, &stat, &Error::ok());
                }
                Err(e) => {
                    callback(lp, file, &StatData::default(), &Error::from(&e));
                }
            }
        },
    );
}

fn close_impl(lp: &mut EventLoop, id: HandleId, callback: Option<CloseCallback>) {
    let token = id.token;
    let Some(file) = file_at(lp, token) else {
        return;
    };

    let was_open = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        let was_open = state.file.take().is_some();
        state.reading = false;
        state.read_callback = None;
        state.end_read_callback = None;
        was_open
    };

    if let Some(callback) = callback {
        let error = if was_open {
            Error::ok()
        } else {
            Error::new(StatusCode::FileNotOpen)
        };
        lp.schedule_callback(move |lp| callback(lp, file, &error));
    }
}

fn bump_jobs(lp: &mut EventLoop, token: Token, delta: isize) {
    if let Some(state) = state_mut(lp, token) {
        state.jobs = state.jobs.saturating_add_signed(delta);
    }
}

fn state_ref_by_token(lp: &EventLoop, token: Token) -> Option<&FileState> {
    match lp.handles.get(token.0) {
        Some(entry) => match &entry.kind {
            HandleKind::File(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn ensure_watch(lp: &mut EventLoop, token: Token) {
    let already = state_ref_by_token(lp, token).is_some_and(|s| s.watch.is_some());
    if already {
        return;
    }
    let watch = lp.schedule_call_on_each_loop_cycle(move |lp| on_watch_cycle(lp, token));
    if let Some(state) = state_mut(lp, token) {
        state.watch = Some(watch);
    } else {
        lp.stop_call_on_each_loop_cycle(watch);
    }
}

/// Per-cycle check driving backpressure: resumes paused reads when a
/// buffer frees up and keeps the loop alive while chunks are outstanding.
fn on_watch_cycle(lp: &mut EventLoop, token: Token) {
    let Some(state) = state_ref_by_token(lp, token) else {
        stop_watch(lp, token);
        return;
    };

    let outstanding = state.outstanding_bufs() > 0;
    let wants_read = state.reading && !state.eof_reached && state.jobs == 0;

    if wants_read {
        issue_read(lp, token);
    }

    let still_needed = outstanding || wants_read;
    if !still_needed {
        stop_watch(lp, token);
    }
}

fn stop_watch(lp: &mut EventLoop, token: Token) {
    let watch = state_mut(lp, token).and_then(|s| s.watch.take());
    if let Some(watch) = watch {
        lp.stop_call_on_each_loop_cycle(watch);
    }
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    let outstanding = {
        let Some(state) = state_mut(lp, token) else {
            return;
        };
        state.reading = false;
        state.read_callback = None;
        state.end_read_callback = None;
        state.file = None;
        state.outstanding_bufs()
    };
    if outstanding > 0 {
        debug!(
            "file removal deferred; {} read buffers still referenced; token={:?}",
            outstanding, token
        );
        // Keep cycling so the sweep can observe the buffers coming back.
        ensure_watch(lp, token);
    }
}
