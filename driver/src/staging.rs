use crate::config::ParameterMap;
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// namelist templates live next to the reference experiment files
const EXPREF: &str = "EXPREF";

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("Failed to walk staging directory")]
    Walk(#[from] ignore::Error),
    #[error("Failed to access staged file")]
    Io(#[from] std::io::Error),
    #[error("No namelist templates found under {0}")]
    NoNamelists(PathBuf),
    #[error("Staged path has no file name: {0}")]
    NoFileName(PathBuf),
}

/// The three disjoint sets of files written into a run directory:
/// namelists with tokens to substitute, XML definitions copied verbatim,
/// and forcing inputs that are only ever symlinked.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct StagingSpec {
    pub to_configure: Vec<PathBuf>,
    pub to_copy: Vec<PathBuf>,
    pub to_symlink: Vec<PathBuf>,
}

impl StagingSpec {
    /// Derive the staging sets from a model configuration directory and a
    /// forcing directory. Namelists (`EXPREF/namelist*`) are templates, the
    /// XML domain/field definitions (`EXPREF/*.xml`) are copied and every
    /// direct entry of the forcing directory is symlinked.
    pub fn from_layout(cfg_path: &Path, forcing_path: &Path) -> Result<Self, StagingError> {
        let expref = cfg_path.join(EXPREF);

        let to_configure = collect_matching(&expref, "namelist*")?;
        if to_configure.is_empty() {
            return Err(StagingError::NoNamelists(expref));
        }

        // a namelist that also matches *.xml must not be staged twice
        let to_copy = collect_matching(&expref, "*.xml")?
            .into_iter()
            .filter(|path| !to_configure.contains(path))
            .collect_vec();

        Ok(Self {
            to_configure,
            to_copy,
            to_symlink: collect_entries(forcing_path)?,
        })
    }

    /// a file is staged exactly once, `from_layout` keeps this by construction
    pub fn is_disjoint(&self) -> bool {
        self.to_configure
            .iter()
            .chain(self.to_copy.iter())
            .chain(self.to_symlink.iter())
            .duplicates()
            .next()
            .is_none()
    }

    /// Write the staged files into `run_dir`: substitute tokens in the
    /// template set, copy the copy set, symlink the symlink set.
    pub fn materialize(&self, run_dir: &Path, params: &ParameterMap) -> Result<(), StagingError> {
        for path in &self.to_configure {
            let target = run_dir.join(file_name(path)?);
            let rendered = configure_text(&fs::read_to_string(path)?, params);

            debug!(source = ?path, target = ?target, "Configured template");
            fs::write(target, rendered)?;
        }

        for path in &self.to_copy {
            fs::copy(path, run_dir.join(file_name(path)?))?;
        }

        for path in &self.to_symlink {
            // link against the resolved path so the run directory stays
            // usable when the job lands on another node
            let source = fs::canonicalize(path)?;
            std::os::unix::fs::symlink(source, run_dir.join(file_name(path)?))?;
        }

        Ok(())
    }
}

/// Replace every `;KEY;` token with its value, for exactly the injected keys.
/// Everything else passes through byte for byte.
pub fn configure_text(input: &str, params: &ParameterMap) -> String {
    let mut output = input.to_owned();

    for (key, value) in params {
        let token = format!(";{key};");
        output = output.replace(&token, value);
    }

    output
}

fn file_name(path: &Path) -> Result<&std::ffi::OsStr, StagingError> {
    path.file_name()
        .ok_or_else(|| StagingError::NoFileName(path.to_path_buf()))
}

/// files directly under `root` whose name matches `pattern`, sorted for
/// deterministic staging
fn collect_matching(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, StagingError> {
    let glob = GlobBuilder::new(pattern).build()?.compile_matcher();

    Ok(collect_entries(root)?
        .into_iter()
        .filter(|path| {
            path.file_name()
                .map(|name| glob.is_match(Path::new(name)))
                .unwrap_or(false)
        })
        .collect_vec())
}

/// Every direct entry of `root`, sorted for deterministic staging. A missing
/// or unreadable directory is an error, not an empty set: silently staging
/// nothing would submit a run with no inputs.
fn collect_entries(root: &Path) -> Result<Vec<PathBuf>, StagingError> {
    Ok(WalkBuilder::new(root)
        .max_depth(Some(1))
        .build()
        .map(|entry| entry.map(DirEntry::into_path))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|path| path != root)
        .sorted()
        .collect_vec())
}
