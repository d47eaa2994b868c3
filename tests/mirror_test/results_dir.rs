use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use tempfile::{tempdir, TempDir};

pub const SUFFIX: &str = ".result.json";

/// A scratch results directory that tests write outcome files into.
pub struct ResultDir {
    dir: TempDir,
}

impl ResultDir {
    pub fn new() -> Self {
        Self {
            dir: tempdir().expect("Couldn't create temporary directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn result_path(&self, logical_path: &str) -> PathBuf {
        self.path().join(format!("{}{}", logical_path, SUFFIX))
    }

    /// Writes the outcome of the test at `logical_path`, creating parent
    /// directories as needed.
    pub fn write_result(&self, logical_path: &str, status: &str) {
        let path = self.result_path(logical_path);
        fs_err::create_dir_all(path.parent().unwrap()).unwrap();
        fs_err::write(
            path,
            format!(r#"{{ "status": "{}", "durationMs": 12 }}"#, status),
        )
        .unwrap();
    }

    pub fn write_raw(&self, relative: &str, contents: &str) {
        let path = self.path().join(relative);
        fs_err::create_dir_all(path.parent().unwrap()).unwrap();
        fs_err::write(path, contents).unwrap();
    }

    pub fn remove_result(&self, logical_path: &str) {
        fs_err::remove_file(self.result_path(logical_path)).unwrap();
    }

    pub fn mkdir(&self, relative: &str) {
        fs_err::create_dir_all(self.path().join(relative)).unwrap();
    }

    pub fn remove_dir(&self, relative: &str) {
        fs_err::remove_dir_all(self.path().join(relative)).unwrap();
    }
}

/// Polls `condition` until it holds or a few seconds pass. File watching
/// delivers events asynchronously, so assertions on a live session go
/// through here.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }

    condition()
}
