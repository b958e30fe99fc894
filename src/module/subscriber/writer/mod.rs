//! Reference [`ConsumerFactory`](super::ConsumerFactory) implementations writing files
//!
//! Every writer produces one file per group and metric, named `<group>_<METRIC>.<extension>`,
//! inside the output directory of the evaluation.

mod binary;
mod tabular;

pub use binary::BinaryWriterFactory;
pub use tabular::TabularWriterFactory;

use super::ConsumerError;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Name of a group or metric can not be used as part of a file name
#[derive(Debug, Error)]
#[error("{kind} name '{name}' is not usable in a file name")]
pub struct InvalidNameError {
    kind: &'static str,
    name: String,
}

fn validate<'a>(kind: &'static str, name: &'a str) -> Result<&'a str, ConsumerError> {
    let usable = !name.trim().is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| c == '/' || c == '\\' || c == '\0');

    if usable {
        Ok(name)
    } else {
        Err(ConsumerError::recoverable(InvalidNameError {
            kind,
            name: name.to_owned(),
        }))
    }
}

/// Location of the artifact holding one metric of one group
fn artifact_path(
    directory: &Path,
    group_id: &str,
    metric: &str,
    extension: &str,
) -> Result<PathBuf, ConsumerError> {
    let group_id = validate("group", group_id)?;
    let metric = validate("metric", metric)?;

    Ok(directory.join(format!("{}_{}.{}", group_id, metric, extension)))
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, ConsumerError> {
    mutex
        .lock()
        .map_err(|_| ConsumerError::unrecoverable("writer state is poisoned"))
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn name_artifacts_after_group_and_metric() {
        let path = artifact_path(Path::new("/out"), "DRRC2", "MEAN_ERROR", "csv").unwrap();

        assert_eq!(path, PathBuf::from("/out/DRRC2_MEAN_ERROR.csv"));
    }

    #[test]
    fn reject_unusable_names() {
        for (group, metric) in &[("", "MEAN_ERROR"), ("DRRC2", "../etc"), ("..", "X"), ("A", " ")] {
            let error = artifact_path(Path::new("/out"), group, metric, "csv").unwrap_err();
            assert!(error.is_recoverable());
        }
    }
}
