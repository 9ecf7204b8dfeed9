use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Lexically normalises a client-supplied relative path.
///
/// Roots, drive prefixes and `.` are dropped. `..` pops a preceding component
/// and is discarded when there is nothing left to pop, so the result can never
/// climb above the directory it is later joined onto.
pub fn sanitize_relative_path(raw: &str) -> PathBuf {
    let mut components: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => components.push(part),
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    components.iter().collect()
}

/// Accepts only names that are a single plain path component.
pub fn validate_single_component(name: &str) -> Result<(), AppError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(AppError::PathTraversal(format!("'{}' is not a plain name", name))),
    }
}

/// Joins `relative` onto `root` and resolves symlinks, rejecting results that
/// escape `root`. A missing target maps to [`AppError::NotFound`].
pub fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf, AppError> {
    let canonical_root = dunce::canonicalize(root)
        .map_err(|_| AppError::NotFound(format!("Directory not found: {}", root.display())))?;
    let candidate = canonical_root.join(relative);
    let resolved = match dunce::canonicalize(&candidate) {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound("File not found".to_string()));
        }
        Err(e) => return Err(AppError::Io(e)),
    };

    if !resolved.starts_with(&canonical_root) {
        debug!(path = %resolved.display(), root = %canonical_root.display(), "Resolved path escapes root");
        return Err(AppError::PathTraversal(format!(
            "{} is outside of {}",
            relative.display(),
            root.display()
        )));
    }
    Ok(resolved)
}
