use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispositionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("source path has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("source path contains unsupported component: {0}")]
    UnsupportedComponent(PathBuf),
    #[error("no free name for {0} in its target directory")]
    NoFreeName(PathBuf),
}

/// Numbered variants tried before giving up on a taken target name.
const MAX_NAME_ATTEMPTS: u32 = 1_000;

/// Terminal state of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Uploaded,
    Duplicate,
    Failed,
}

/// What happens to a local file once its candidate is done.
#[derive(Debug, Clone, Default)]
pub struct Disposition {
    pub done_dir: Option<PathBuf>,
    pub error_dir: Option<PathBuf>,
    /// Delete uploaded and duplicate files instead of relocating them.
    pub delete_uploaded: bool,
}

/// Where the file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Kept,
    Deleted,
    Moved(PathBuf),
}

impl Disposition {
    pub async fn apply(
        &self,
        batch_root: Option<&Path>,
        source: &Path,
        outcome: Outcome,
    ) -> Result<Placement, DispositionError> {
        let target_root = match outcome {
            Outcome::Uploaded | Outcome::Duplicate if self.delete_uploaded => {
                tokio::fs::remove_file(source).await?;
                return Ok(Placement::Deleted);
            }
            Outcome::Uploaded | Outcome::Duplicate => self.done_dir.as_deref(),
            Outcome::Failed => self.error_dir.as_deref(),
        };
        let Some(target_root) = target_root else {
            return Ok(Placement::Kept);
        };

        let target = relocated_path(target_root, batch_root, source)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = numbered_path(&target, attempt);
            match move_file(source, &candidate).await {
                Ok(()) => return Ok(Placement::Moved(candidate)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(DispositionError::NoFreeName(target))
    }
}

/// Maps `source` under `target_root`, keeping its path relative to
/// `batch_root` when it lies inside it and only the file name otherwise.
pub fn relocated_path(
    target_root: &Path,
    batch_root: Option<&Path>,
    source: &Path,
) -> Result<PathBuf, DispositionError> {
    let relative = batch_root
        .and_then(|root| source.strip_prefix(root).ok())
        .filter(|rel| !rel.as_os_str().is_empty());
    let Some(relative) = relative else {
        let name = source
            .file_name()
            .ok_or_else(|| DispositionError::NoFileName(source.to_path_buf()))?;
        return Ok(target_root.join(name));
    };

    let mut out = target_root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(DispositionError::UnsupportedComponent(source.to_path_buf()));
            }
        }
    }
    Ok(out)
}

/// `IMG.jpg`, `IMG (1).jpg`, `IMG (2).jpg`, ...
fn numbered_path(path: &Path, attempt: u32) -> PathBuf {
    if attempt == 0 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem} ({attempt}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({attempt})"),
    };
    path.with_file_name(name)
}

/// Moves `source` to `target`, failing with `AlreadyExists` instead of
/// replacing an existing file.
async fn move_file(source: &Path, target: &Path) -> io::Result<()> {
    match tokio::fs::hard_link(source, target).await {
        Ok(()) => return tokio::fs::remove_file(source).await,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(err),
        Err(_) => {}
    }

    // Cross-device moves copy into a freshly created file.
    let mut reader = tokio::fs::File::open(source).await?;
    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
        .await?;
    let copied = async {
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_all().await
    }
    .await;
    drop(writer);
    if let Err(err) = copied {
        let _ = tokio::fs::remove_file(target).await;
        return Err(err);
    }
    tokio::fs::remove_file(source).await
}
