use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

use evio::fs::{
    make_all_dirs, make_dir, make_temp_dir, remove_dir_with_progress, Dir, DirectoryEntryType,
};
use evio::{EventLoop, StatusCode};

mod util;
use util::{init, temp_path};

fn populate_dir() -> PathBuf {
    let root = temp_path("evio-dir");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("plain.txt"), b"x").unwrap();
    std::fs::create_dir(root.join("nested")).unwrap();
    std::os::unix::fs::symlink("plain.txt", root.join("link")).unwrap();
    root
}

#[test]
fn list_reports_names_and_types() {
    init();

    let root = populate_dir();

    let mut lp = EventLoop::new().unwrap();
    let entries = Rc::new(RefCell::new(HashMap::new()));
    let ended = Rc::new(Cell::new(false));

    let dir = Dir::new(&mut lp);
    {
        let entries = Rc::clone(&entries);
        let ended = Rc::clone(&ended);
        dir.open(&mut lp, &root, move |lp, dir, error| {
            assert!(error.is_ok(), "{}", error);
            let entries = Rc::clone(&entries);
            let ended = Rc::clone(&ended);
            dir.list(
                lp,
                move |_lp, _dir, name, entry_type| {
                    entries.borrow_mut().insert(name.to_string(), entry_type);
                },
                move |_lp, _dir| ended.set(true),
            )
            .unwrap();
        });
    }

    lp.run().unwrap();

    assert!(ended.get());
    let entries = entries.borrow();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries.get("plain.txt"), Some(&DirectoryEntryType::File));
    assert_eq!(entries.get("nested"), Some(&DirectoryEntryType::Dir));
    assert_eq!(entries.get("link"), Some(&DirectoryEntryType::Link));

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn continuation_stops_after_current_entry() {
    init();

    let root = populate_dir();

    let mut lp = EventLoop::new().unwrap();
    let seen = Rc::new(Cell::new(0usize));

    let dir = Dir::new(&mut lp);
    {
        let seen = Rc::clone(&seen);
        dir.open(&mut lp, &root, move |lp, dir, error| {
            assert!(error.is_ok(), "{}", error);
            let seen = Rc::clone(&seen);
            dir.list_with_continuation(
                lp,
                move |_lp, _dir, _name, _entry_type, continuation| {
                    seen.set(seen.get() + 1);
                    continuation.stop();
                },
                |_lp, _dir| {},
            )
            .unwrap();
        });
    }

    lp.run().unwrap();
    assert_eq!(seen.get(), 1);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn list_on_unopened_dir_fails_with_dir_not_open() {
    init();

    let mut lp = EventLoop::new().unwrap();
    let dir = Dir::new(&mut lp);
    let result = dir.list(&mut lp, |_, _, _, _| {}, |_, _| {});
    assert_eq!(result.unwrap_err().code(), StatusCode::DirNotOpen);
    lp.run().unwrap();
}

#[test]
fn simultaneous_listings_are_rejected() {
    init();

    let root = populate_dir();

    let mut lp = EventLoop::new().unwrap();
    let second_code = Rc::new(Cell::new(StatusCode::Ok));

    let dir = Dir::new(&mut lp);
    {
        let second_code = Rc::clone(&second_code);
        dir.open(&mut lp, &root, move |lp, dir, error| {
            assert!(error.is_ok(), "{}", error);
            dir.list(lp, |_, _, _, _| {}, |_, _| {}).unwrap();
            let result = dir.list(lp, |_, _, _, _| {}, |_, _| {});
            second_code.set(result.unwrap_err().code());
        });
    }

    lp.run().unwrap();
    assert_eq!(second_code.get(), StatusCode::OperationAlreadyInProgress);

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn double_close_is_rejected_while_close_is_in_flight() {
    init();

    let root = populate_dir();

    let mut lp = EventLoop::new().unwrap();
    let closed = Rc::new(Cell::new(false));

    let dir = Dir::new(&mut lp);
    {
        let closed = Rc::clone(&closed);
        dir.open(&mut lp, &root, move |lp, dir, error| {
            assert!(error.is_ok(), "{}", error);
            let closed = Rc::clone(&closed);
            dir.close(lp, move |_lp, _dir, error| {
                assert!(error.is_ok(), "{}", error);
                closed.set(true);
            })
            .unwrap();
            let second = dir.close(lp, |_, _, _| {});
            assert_eq!(
                second.unwrap_err().code(),
                StatusCode::OperationAlreadyInProgress
            );
        });
    }

    lp.run().unwrap();
    assert!(closed.get());

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn make_temp_dir_creates_from_template() {
    init();

    let template = temp_path("evio-tmp").with_extension("XXXXXX");

    let mut lp = EventLoop::new().unwrap();
    let created = Rc::new(RefCell::new(PathBuf::new()));
    {
        let created = Rc::clone(&created);
        make_temp_dir(&mut lp, &template, move |_lp, path, error| {
            assert!(error.is_ok(), "{}", error);
            *created.borrow_mut() = path.to_path_buf();
        });
    }

    lp.run().unwrap();

    let created = created.borrow();
    assert!(created.is_dir());
    assert!(!created.to_string_lossy().ends_with("XXXXXX"));

    std::fs::remove_dir(&*created).unwrap();
}

#[test]
fn make_dir_reports_existing_directory() {
    init();

    let path = temp_path("evio-mkdir");
    std::fs::create_dir(&path).unwrap();

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    {
        let code = Rc::clone(&code);
        make_dir(&mut lp, &path, 0o755, move |_lp, error| {
            code.set(error.code());
        });
    }

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::FileOrDirAlreadyExists);

    std::fs::remove_dir(&path).unwrap();
}

#[test]
fn make_all_dirs_creates_intermediate_directories() {
    init();

    let root = temp_path("evio-mkall");
    let deep = root.join("a/b/c");

    let mut lp = EventLoop::new().unwrap();
    let ok = Rc::new(Cell::new(false));
    {
        let ok = Rc::clone(&ok);
        make_all_dirs(&mut lp, &deep, 0o755, move |_lp, error| {
            ok.set(error.is_ok());
        });
    }

    lp.run().unwrap();
    assert!(ok.get());
    assert!(deep.is_dir());

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn make_all_dirs_failure_reports_deepest_path_reached() {
    init();

    // A file in the middle of the requested chain stops the walk.
    let root = temp_path("evio-mkall-fail");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("blocker"), b"x").unwrap();
    let requested = root.join("blocker/leaf");

    let mut lp = EventLoop::new().unwrap();
    let code = Rc::new(Cell::new(StatusCode::Ok));
    let context = Rc::new(RefCell::new(String::new()));
    {
        let code = Rc::clone(&code);
        let context = Rc::clone(&context);
        make_all_dirs(&mut lp, &requested, 0o755, move |_lp, error| {
            code.set(error.code());
            *context.borrow_mut() = error.context().unwrap_or("").to_string();
        });
    }

    lp.run().unwrap();
    assert_eq!(code.get(), StatusCode::NotADirectory);
    assert_eq!(&*context.borrow(), &root.display().to_string());

    std::fs::remove_dir_all(&root).unwrap();
}

#[test]
fn remove_dir_reports_each_directory_children_first() {
    init();

    let root = temp_path("evio-rm");
    std::fs::create_dir_all(root.join("outer/inner")).unwrap();
    std::fs::write(root.join("outer/file.txt"), b"x").unwrap();
    std::fs::write(root.join("outer/inner/leaf.txt"), b"x").unwrap();

    let mut lp = EventLoop::new().unwrap();
    let progress = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(Cell::new(false));
    {
        let progress = Rc::clone(&progress);
        let done = Rc::clone(&done);
        remove_dir_with_progress(
            &mut lp,
            &root,
            move |_lp, error| {
                assert!(error.is_ok(), "{}", error);
                done.set(true);
            },
            move |_lp, path| progress.borrow_mut().push(path.to_path_buf()),
        );
    }

    lp.run().unwrap();

    assert!(done.get());
    assert!(!root.exists());
    let progress = progress.borrow();
    // Directories only, children before parents.
    assert_eq!(progress.len(), 3);
    assert_eq!(progress[0], root.join("outer/inner"));
    assert_eq!(progress[1], root.join("outer"));
    assert_eq!(progress[2], root);

    std::fs::remove_dir_all(&root).ok();
}
