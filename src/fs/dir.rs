use std::ffi::OsString;
use std::fmt;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};

use log::trace;

use crate::error::{Error, StatusCode};
use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleId, HandleKind};
use crate::token::Token;

/// Type of a directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryEntryType {
    Unknown,
    File,
    Dir,
    Link,
    Fifo,
    Socket,
    Char,
    Block,
}

impl From<std::fs::FileType> for DirectoryEntryType {
    fn from(file_type: std::fs::FileType) -> DirectoryEntryType {
        if file_type.is_symlink() {
            DirectoryEntryType::Link
        } else if file_type.is_dir() {
            DirectoryEntryType::Dir
        } else if file_type.is_fifo() {
            DirectoryEntryType::Fifo
        } else if file_type.is_socket() {
            DirectoryEntryType::Socket
        } else if file_type.is_char_device() {
            DirectoryEntryType::Char
        } else if file_type.is_block_device() {
            DirectoryEntryType::Block
        } else if file_type.is_file() {
            DirectoryEntryType::File
        } else {
            DirectoryEntryType::Unknown
        }
    }
}

impl fmt::Display for DirectoryEntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DirectoryEntryType::Unknown => "UNKNOWN",
            DirectoryEntryType::File => "FILE",
            DirectoryEntryType::Dir => "DIR",
            DirectoryEntryType::Link => "LINK",
            DirectoryEntryType::Fifo => "FIFO",
            DirectoryEntryType::Socket => "SOCKET",
            DirectoryEntryType::Char => "CHAR",
            DirectoryEntryType::Block => "BLOCK",
        };
        f.write_str(name)
    }
}

/// Lets a listing callback cancel iteration after the current entry.
#[derive(Debug, Default)]
pub struct Continuation {
    stopped: bool,
}

impl Continuation {
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

type OpenCallback = Box<dyn FnOnce(&mut EventLoop, Dir, &Error)>;
type CloseCallback = Box<dyn FnOnce(&mut EventLoop, Dir, &Error)>;
type EndListCallback = Box<dyn FnOnce(&mut EventLoop, Dir)>;

/// Asynchronous directory handle for listing entries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dir {
    id: HandleId,
}

pub(crate) struct DirState {
    path: PathBuf,
    open: bool,
    listing: bool,
    closing: bool,
    jobs: usize,
}

impl DirState {
    fn new() -> DirState {
        DirState {
            path: PathBuf::new(),
            open: false,
            listing: false,
            closing: false,
            jobs: 0,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.jobs > 0
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.jobs == 0
    }
}

fn state_mut(lp: &mut EventLoop, token: Token) -> Option<&mut DirState> {
    match lp.entry_mut(token) {
        Some(entry) => match &mut entry.kind {
            HandleKind::Dir(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn state_ref(lp: &EventLoop, id: HandleId) -> Option<&DirState> {
    match lp.resolve_ref(id) {
        Some(entry) => match &entry.kind {
            HandleKind::Dir(state) => Some(state),
            _ => None,
        },
        None => None,
    }
}

fn dir_at(lp: &EventLoop, token: Token) -> Option<Dir> {
    lp.gen_of(token).map(|gen| Dir {
        id: HandleId { token, gen },
    })
}

impl Dir {
    pub fn new(lp: &mut EventLoop) -> Dir {
        let id = lp.allocate_handle(HandleKind::Dir(DirState::new()));
        Dir { id }
    }

    pub fn open<P, F>(&self, lp: &mut EventLoop, path: P, callback: F)
    where
        P: Into<PathBuf>,
        F: FnOnce(&mut EventLoop, Dir, &Error) + 'static,
    {
        open_impl(lp, self.id, path.into(), Box::new(callback));
    }

    pub fn is_open(&self, lp: &EventLoop) -> bool {
        state_ref(lp, self.id).is_some_and(|s| s.open)
    }

    pub fn path(&self, lp: &EventLoop) -> PathBuf {
        state_ref(lp, self.id).map_or_else(PathBuf::new, |s| s.path.clone())
    }

    /// Iterates directory entries, delivering each name and type, then
    /// fires `end_callback`.
    ///
    /// Fails with `DirNotOpen` on a closed directory and with
    /// `OperationAlreadyInProgress` while another listing runs.
    pub fn list<F, E>(&self, lp: &mut EventLoop, entry_callback: F, end_callback: E) -> Result<(), Error>
    where
        F: FnMut(&mut EventLoop, Dir, &str, DirectoryEntryType) + 'static,
        E: FnOnce(&mut EventLoop, Dir) + 'static,
    {
        let mut entry_callback = entry_callback;
        self.list_with_continuation(
            lp,
            move |lp, dir, name, entry_type, _continuation| {
                entry_callback(lp, dir, name, entry_type);
            },
            end_callback,
        )
    }

    /// Like [`list`], additionally handing each callback a
    /// [`Continuation`] whose `stop` cancels iteration after the current
    /// entry.
    ///
    /// [`list`]: Dir::list
    pub fn list_with_continuation<F, E>(
        &self,
        lp: &mut EventLoop,
        entry_callback: F,
        end_callback: E,
    ) -> Result<(), Error>
    where
        F: FnMut(&mut EventLoop, Dir, &str, DirectoryEntryType, &mut Continuation) + 'static,
        E: FnOnce(&mut EventLoop, Dir) + 'static,
    {
        list_impl(lp, self.id, Box::new(entry_callback), Box::new(end_callback))
    }

    /// Closes the directory asynchronously. A second close while one is
    /// in flight fails with `OperationAlreadyInProgress`.
    pub fn close<F>(&self, lp: &mut EventLoop, callback: F) -> Result<(), Error>
    where
        F: FnOnce(&mut EventLoop, Dir, &Error) + 'static,
    {
        close_impl(lp, self.id, Box::new(callback))
    }
}

impl Handle for Dir {
    fn handle_id(&self) -> HandleId {
        self.id
    }
}

fn open_impl(lp: &mut EventLoop, id: HandleId, path: PathBuf, callback: OpenCallback) {
    let token = id.token;
    let Some(dir) = dir_at(lp, token) else {
        return;
    };
    if state_ref(lp, id).is_none() {
        return;
    }

    let job_path = path.clone();
    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || validate_directory(&job_path),
        move |lp, result| {
            bump_jobs(lp, token, -1);
            let error = match result {
                Ok(()) => {
                    if let Some(state) = state_mut(lp, token) {
                        state.open = true;
                        state.path = path;
                    }
                    Error::ok()
                }
                Err(error) => error,
            };
            trace!("dir open finished; token={:?}; error={}", token, error);
            callback(lp, dir, &error);
        },
    );
}

fn validate_directory(path: &Path) -> Result<(), Error> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::with_context(StatusCode::from_io_error(&e), path.display().to_string()))?;
    if !metadata.is_dir() {
        return Err(Error::with_context(
            StatusCode::NotADirectory,
            path.display().to_string(),
        ));
    }
    Ok(())
}

type ListEntryCallback =
    Box<dyn FnMut(&mut EventLoop, Dir, &str, DirectoryEntryType, &mut Continuation)>;

fn list_impl(
    lp: &mut EventLoop,
    id: HandleId,
    mut entry_callback: ListEntryCallback,
    end_callback: EndListCallback,
) -> Result<(), Error> {
    let token = id.token;
    let Some(dir) = dir_at(lp, token) else {
        return Err(Error::new(StatusCode::DirNotOpen));
    };

    let path = {
        let Some(state) = state_mut(lp, token) else {
            return Err(Error::new(StatusCode::DirNotOpen));
        };
        if !state.open {
            return Err(Error::new(StatusCode::DirNotOpen));
        }
        if state.listing {
            return Err(Error::new(StatusCode::OperationAlreadyInProgress));
        }
        state.listing = true;
        state.path.clone()
    };

    bump_jobs(lp, token, 1);
    lp.add_work_with_result(
        move || read_entries(&path),
        move |lp, result| {
            bump_jobs(lp, token, -1);
            if let Some(state) = state_mut(lp, token) {
                state.listing = false;
            }
            let entries = match result {
                Ok(entries) => entries,
                Err(e) => {
                    trace!("dir listing failed; token={:?}: {}", token, e);
                    end_callback(lp, dir);
                    return;
                }
            };

            let mut continuation = Continuation::default();
            for (name, entry_type) in entries {
                entry_callback(lp, dir, &name, entry_type, &mut continuation);
                if continuation.is_stopped() {
                    trace!("dir listing stopped by continuation; token={:?}", token);
                    break;
                }
            }
            end_callback(lp, dir);
        },
    );
    Ok(())
}

fn read_entries(path: &Path) -> io::Result<Vec<(String, DirectoryEntryType)>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_type = entry
            .file_type()
            .map(DirectoryEntryType::from)
            .unwrap_or(DirectoryEntryType::Unknown);
        entries.push((entry.file_name().to_string_lossy().into_owned(), entry_type));
    }
    Ok(entries)
}

fn close_impl(lp: &mut EventLoop, id: HandleId, callback: CloseCallback) -> Result<(), Error> {
    let token = id.token;
    let Some(dir) = dir_at(lp, token) else {
        return Err(Error::new(StatusCode::DirNotOpen));
    };

    {
        let Some(state) = state_mut(lp, token) else {
            return Err(Error::new(StatusCode::DirNotOpen));
        };
        if state.closing {
            return Err(Error::new(StatusCode::OperationAlreadyInProgress));
        }
        if !state.open {
            return Err(Error::new(StatusCode::DirNotOpen));
        }
        state.closing = true;
    }

    bump_jobs(lp, token, 1);
    lp.add_work_with_done(
        || {},
        move |lp| {
            bump_jobs(lp, token, -1);
            if let Some(state) = state_mut(lp, token) {
                state.open = false;
                state.closing = false;
            }
            callback(lp, dir, &Error::ok());
        },
    );
    Ok(())
}

fn bump_jobs(lp: &mut EventLoop, token: Token, delta: isize) {
    if let Some(state) = state_mut(lp, token) {
        state.jobs = state.jobs.saturating_add_signed(delta);
    }
}

pub(crate) fn teardown(lp: &mut EventLoop, token: Token) {
    if let Some(state) = state_mut(lp, token) {
        state.open = false;
    }
}

// === Free helpers ===

/// Creates a uniquely named directory from a template ending in
/// `XXXXXX`, delivering the resulting path.
pub fn make_temp_dir<P, F>(lp: &mut EventLoop, name_template: P, callback: F)
where
    P: Into<PathBuf>,
    F: FnOnce(&mut EventLoop, &Path, &Error) + 'static,
{
    let template = name_template.into();
    lp.add_work_with_result(
        move || mkdtemp(&template),
        move |lp, result| match result {
            Ok(path) => callback(lp, &path, &Error::ok()),
            Err(error) => callback(lp, Path::new(""), &error),
        },
    );
}

fn mkdtemp(template: &Path) -> Result<PathBuf, Error> {
    let mut bytes = template.as_os_str().as_bytes().to_vec();
    bytes.push(0);
    // SAFETY: `bytes` is a NUL-terminated buffer that mkdtemp rewrites in
    // place.
    let ptr = unsafe { libc::mkdtemp(bytes.as_mut_ptr() as *mut libc::c_char) };
    if ptr.is_null() {
        let e = io::Error::last_os_error();
        return Err(Error::with_context(
            StatusCode::from_io_error(&e),
            template.display().to_string(),
        ));
    }
    bytes.pop();
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

/// Creates a single directory with `mode`.
pub fn make_dir<P, F>(lp: &mut EventLoop, path: P, mode: u32, callback: F)
where
    P: Into<PathBuf>,
    F: FnOnce(&mut EventLoop, &Error) + 'static,
{
    let path = path.into();
    lp.add_work_with_result(
        move || {
            std::fs::DirBuilder::new()
                .mode(mode)
                .create(&path)
                .map_err(|e| {
                    Error::with_context(StatusCode::from_io_error(&e), path.display().to_string())
                })
        },
        move |lp, result| match result {
            Ok(()) => callback(lp, &Error::ok()),
            Err(error) => callback(lp, &error),
        },
    );
}

/// Creates a directory and all missing parents. On failure the error's
/// context string names the deepest path that was reached.
pub fn make_all_dirs<P, F>(lp: &mut EventLoop, path: P, mode: u32, callback: F)
where
    P: Into<PathBuf>,
    F: FnOnce(&mut EventLoop, &Error) + 'static,
{
    let path = path.into();
    lp.add_work_with_result(
        move || make_all_dirs_blocking(&path, mode),
        move |lp, result| match result {
            Ok(()) => callback(lp, &Error::ok()),
            Err(error) => callback(lp, &error),
        },
    );
}

fn make_all_dirs_blocking(path: &Path, mode: u32) -> Result<(), Error> {
    let mut current = PathBuf::new();
    let mut reached = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match std::fs::metadata(&current) {
            Ok(metadata) if metadata.is_dir() => {
                reached = current.clone();
                continue;
            }
            Ok(_) => {
                return Err(Error::with_context(
                    StatusCode::NotADirectory,
                    reached.display().to_string(),
                ));
            }
            Err(_) => {}
        }
        if let Err(e) = std::fs::DirBuilder::new().mode(mode).create(&current) {
            return Err(Error::with_context(
                StatusCode::from_io_error(&e),
                reached.display().to_string(),
            ));
        }
        reached = current.clone();
    }
    Ok(())
}

/// Removes `path` recursively, children before parent.
pub fn remove_dir<P, F>(lp: &mut EventLoop, path: P, callback: F)
where
    P: Into<PathBuf>,
    F: FnOnce(&mut EventLoop, &Error) + 'static,
{
    remove_dir_with_progress(lp, path, callback, |_lp, _path: &Path| {});
}

/// Removes `path` recursively, reporting each removed directory (but not
/// files) through `progress_callback` in children-before-parent order.
pub fn remove_dir_with_progress<P, F, G>(
    lp: &mut EventLoop,
    path: P,
    callback: F,
    progress_callback: G,
) where
    P: Into<PathBuf>,
    F: FnOnce(&mut EventLoop, &Error) + 'static,
    G: FnMut(&mut EventLoop, &Path) + 'static,
{
    let path = path.into();
    let mut progress_callback = progress_callback;
    lp.add_work_with_result(
        move || {
            let mut removed = Vec::new();
            let result = remove_dir_blocking(&path, &mut removed);
            (removed, result)
        },
        move |lp, (removed, result)| {
            for dir_path in &removed {
                progress_callback(lp, dir_path);
            }
            match result {
                Ok(()) => callback(lp, &Error::ok()),
                Err(error) => callback(lp, &error),
            }
        },
    );
}

fn remove_dir_blocking(path: &Path, removed: &mut Vec<PathBuf>) -> Result<(), Error> {
    let context = |e: &io::Error, at: &Path| {
        Error::with_context(StatusCode::from_io_error(e), at.display().to_string())
    };

    let entries = std::fs::read_dir(path).map_err(|e| context(&e, path))?;
    for entry in entries {
        let entry = entry.map_err(|e| context(&e, path))?;
        let entry_path = entry.path();
        let file_type = entry.file_type().map_err(|e| context(&e, &entry_path))?;
        if file_type.is_dir() {
            remove_dir_blocking(&entry_path, removed)?;
        } else {
            std::fs::remove_file(&entry_path).map_err(|e| context(&e, &entry_path))?;
        }
    }
    std::fs::remove_dir(path).map_err(|e| context(&e, path))?;
    removed.push(path.to_path_buf());
    Ok(())
}
