use std::path::{Component, Path, PathBuf};
use anyhow::bail;

/// Resolves a file name from a command relative to a base directory. Names must stay inside
///  the directory: absolute paths and `..` are rejected.
pub fn resolve_file_name(base_dir: &Path, name: &str) -> anyhow::Result<PathBuf> {
    let relative = Path::new(name);

    let mut has_file_component = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_file_component = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("Invalid file name: {}", name);
            }
        }
    }
    if !has_file_component {
        bail!("Invalid file name: {:?}", name);
    }

    Ok(base_dir.join(relative))
}
