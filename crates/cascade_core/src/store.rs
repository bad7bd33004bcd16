use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::eigen::{DiagInfo, ShellRecord};
use crate::error::{CascadeError, Result};

/// On-disk archive of per-shell eigenbases, one file per shell. Written
/// during the energy pass and read back for resumes and the density-matrix
/// pass.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn shell_path(&self, shell: usize) -> PathBuf {
        self.root.join(format!("shell-{shell:04}.json"))
    }

    pub fn save(&self, shell: usize, diag: &DiagInfo) -> Result<()> {
        let path = self.shell_path(shell);
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, &ShellRecord::from_diag(shell, diag))?;
        writer.flush()?;
        debug!(shell, path = %path.display(), "shell basis stored");
        Ok(())
    }

    pub fn load(&self, shell: usize) -> Result<DiagInfo> {
        let path = self.shell_path(shell);
        let reader = BufReader::new(File::open(&path)?);
        let record: ShellRecord = serde_json::from_reader(reader)?;
        if record.shell != shell {
            return Err(CascadeError::Structure(format!(
                "store file {} carries shell {}, expected {}",
                path.display(),
                record.shell,
                shell
            )));
        }
        debug!(shell, "shell basis loaded");
        record.into_diag()
    }

    pub fn has(&self, shell: usize) -> bool {
        self.shell_path(shell).is_file()
    }

    /// Highest shell up to `upto` with a stored basis.
    pub fn last_shell(&self, upto: usize) -> Option<usize> {
        (1..=upto).rev().find(|&n| self.has(n))
    }
}
