use super::{artifact_path, lock};
use crate::domain::{
    ConsumerDescription, EvaluationDescriptor, Format, GroupIdentifier, Statistic,
    StatisticsMessage,
};
use crate::library::{BoxedError, EmptyResult};
use crate::module::subscriber::{Artifacts, ConsumerError, ConsumerFactory, GroupConsumer, MessageConsumer};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error};

const HEADER: &str = "evaluation_id,group_id,sequence,metric,pool,value,sample_size,unit";

/// Writes statistics as comma separated rows, one file per group and metric
pub struct TabularWriterFactory {
    description: ConsumerDescription,
    evaluations: Mutex<Vec<Weak<Mutex<TabularFiles>>>>,
}

impl TabularWriterFactory {
    /// Creates a factory with a fresh consumer identity
    pub fn new() -> Self {
        Self {
            description: ConsumerDescription::new(vec![Format::Csv]),
            evaluations: Mutex::new(Vec::new()),
        }
    }

    fn files(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<Arc<Mutex<TabularFiles>>, ConsumerError> {
        let mut evaluations = lock(&self.evaluations)?;
        evaluations.retain(|files| files.strong_count() > 0);

        // Message and group consumer of one evaluation share their files
        for files in evaluations.iter().filter_map(Weak::upgrade) {
            let matches = lock(&files)
                .map(|files| files.evaluation.id == evaluation.id && files.directory == output_dir)
                .unwrap_or(false);

            if matches {
                return Ok(files);
            }
        }

        let files = Arc::new(Mutex::new(TabularFiles {
            evaluation: evaluation.clone(),
            directory: output_dir.to_owned(),
            handles: BTreeMap::new(),
            written: BTreeMap::new(),
        }));
        evaluations.push(Arc::downgrade(&files));

        Ok(files)
    }
}

impl Default for TabularWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerFactory for TabularWriterFactory {
    fn describe(&self) -> ConsumerDescription {
        self.description.clone()
    }

    fn build_message_consumer(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<MessageConsumer, ConsumerError> {
        let files = self.files(evaluation, output_dir)?;
        Ok(Arc::new(move |message: &StatisticsMessage| {
            lock(&files)?.write(message)
        }))
    }

    fn build_group_consumer(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<GroupConsumer, ConsumerError> {
        let files = self.files(evaluation, output_dir)?;

        Ok(Arc::new(move |messages: &[StatisticsMessage]| match messages.first() {
            Some(message) => lock(&files)?.finish_group(&message.group_id),
            None => Ok(Artifacts::new()),
        }))
    }

    fn close(&self) -> EmptyResult {
        let evaluations = match self.evaluations.lock() {
            Ok(mut evaluations) => std::mem::take(&mut *evaluations),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut failures = 0;

        for files in evaluations.iter().filter_map(Weak::upgrade) {
            let mut files = match files.lock() {
                Ok(files) => files,
                Err(poisoned) => poisoned.into_inner(),
            };

            for (path, e) in files.flush_all() {
                error!(path = %path.display(), error = %e, "Failed to flush tabular output");
                failures += 1;
            }
        }

        if failures > 0 {
            let error: BoxedError = format!("{} tabular outputs could not be flushed", failures).into();
            return Err(error);
        }

        Ok(())
    }
}

/// Open files of one evaluation
struct TabularFiles {
    evaluation: Arc<EvaluationDescriptor>,
    directory: PathBuf,
    handles: BTreeMap<PathBuf, (GroupIdentifier, BufWriter<File>)>,
    written: BTreeMap<GroupIdentifier, Artifacts>,
}

impl TabularFiles {
    fn write(&mut self, message: &StatisticsMessage) -> Result<Artifacts, ConsumerError> {
        let mut artifacts = Artifacts::new();

        // Validate every name before touching the disk so a bad message writes nothing
        let paths = message
            .statistics
            .iter()
            .map(|statistic| artifact_path(&self.directory, &message.group_id, &statistic.metric, "csv"))
            .collect::<Result<Vec<_>, _>>()?;

        for (statistic, path) in message.statistics.iter().zip(paths) {
            let row = self.row(message, statistic);
            let writer = self.handle(&message.group_id, &path)?;

            writer
                .write_all(row.as_bytes())
                .map_err(ConsumerError::unrecoverable)?;

            artifacts.insert(path);
        }

        self.written
            .entry(message.group_id.clone())
            .or_default()
            .extend(artifacts.iter().cloned());

        Ok(artifacts)
    }

    fn handle(
        &mut self,
        group_id: &str,
        path: &Path,
    ) -> Result<&mut BufWriter<File>, ConsumerError> {
        if !self.handles.contains_key(path) {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(ConsumerError::unrecoverable)?;
            let empty = file
                .metadata()
                .map(|metadata| metadata.len() == 0)
                .map_err(ConsumerError::unrecoverable)?;

            let mut writer = BufWriter::new(file);
            if empty {
                writeln!(writer, "{}", HEADER).map_err(ConsumerError::unrecoverable)?;
            }

            debug!(path = %path.display(), "Opened tabular output");
            self.handles
                .insert(path.to_owned(), (group_id.to_owned(), writer));
        }

        self.handles
            .get_mut(path)
            .map(|(_, writer)| writer)
            .ok_or_else(|| ConsumerError::unrecoverable("tabular output vanished"))
    }

    fn row(&self, message: &StatisticsMessage, statistic: &Statistic) -> String {
        let value = if statistic.value.is_nan() {
            String::new()
        } else {
            statistic.value.to_string()
        };
        let sample_size = statistic
            .sample_size
            .map(|size| size.to_string())
            .unwrap_or_default();

        let fields = [
            escape(&message.evaluation_id),
            escape(&message.group_id),
            message.sequence.to_string(),
            escape(&statistic.metric),
            escape(&statistic.pool),
            value,
            sample_size,
            escape(&self.evaluation.measurement.unit),
        ];

        format!("{}\n", fields.join(","))
    }

    /// Flushes and releases every file of a group and returns the files written for it
    fn finish_group(&mut self, group_id: &str) -> Result<Artifacts, ConsumerError> {
        let paths: Vec<PathBuf> = self
            .handles
            .iter()
            .filter(|(_, (group, _))| group == group_id)
            .map(|(path, _)| path.clone())
            .collect();

        for path in paths {
            if let Some((_, mut writer)) = self.handles.remove(&path) {
                writer.flush().map_err(ConsumerError::unrecoverable)?;
            }
        }

        Ok(self.written.remove(group_id).unwrap_or_default())
    }

    fn flush_all(&mut self) -> Vec<(PathBuf, io::Error)> {
        std::mem::take(&mut self.handles)
            .into_iter()
            .filter_map(|(path, (_, mut writer))| writer.flush().err().map(|e| (path, e)))
            .collect()
    }
}

fn escape(field: &str) -> String {
    if field.contains(|c: char| c == ',' || c == '"' || c == '\n' || c == '\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::MeasurementMetadata;
    use pretty_assertions::assert_eq;

    fn evaluation() -> Arc<EvaluationDescriptor> {
        Arc::new(
            EvaluationDescriptor::new(
                vec![Format::Csv],
                MeasurementMetadata {
                    variable: "streamflow".into(),
                    unit: "CMS".into(),
                    labels: Default::default(),
                },
            )
            .with_id("e1"),
        )
    }

    fn message(group_id: &str, sequence: u64, statistics: Vec<Statistic>) -> StatisticsMessage {
        StatisticsMessage {
            evaluation_id: "e1".into(),
            group_id: group_id.into(),
            sequence,
            statistics,
        }
    }

    #[test]
    fn write_one_file_per_group_and_metric() {
        let directory = tempfile::tempdir().unwrap();
        let factory = TabularWriterFactory::new();
        let consume = factory
            .build_message_consumer(&evaluation(), directory.path())
            .unwrap();
        let finish = factory
            .build_group_consumer(&evaluation(), directory.path())
            .unwrap();

        let first = message(
            "DRRC2",
            1,
            vec![
                Statistic::new("MEAN_ERROR", "0-6h", 0.5),
                Statistic::new("BIAS_FRACTION", "0-6h", f64::NAN),
            ],
        );
        let second = message("DRRC2", 2, vec![Statistic::new("MEAN_ERROR", "6-12h", 1.5)]);

        consume(&first).unwrap();
        consume(&second).unwrap();
        let written = finish(&[first, second][..]).unwrap();

        let mean_error = directory.path().join("DRRC2_MEAN_ERROR.csv");
        let bias = directory.path().join("DRRC2_BIAS_FRACTION.csv");
        assert_eq!(
            written,
            vec![bias.clone(), mean_error.clone()]
                .into_iter()
                .collect::<Artifacts>()
        );

        assert_eq!(
            std::fs::read_to_string(mean_error).unwrap(),
            format!(
                "{}\ne1,DRRC2,1,MEAN_ERROR,0-6h,0.5,,CMS\ne1,DRRC2,2,MEAN_ERROR,6-12h,1.5,,CMS\n",
                HEADER
            )
        );
        assert_eq!(
            std::fs::read_to_string(bias).unwrap(),
            format!("{}\ne1,DRRC2,1,BIAS_FRACTION,0-6h,,,CMS\n", HEADER)
        );
    }

    #[test]
    fn skip_messages_with_unusable_metrics() {
        let directory = tempfile::tempdir().unwrap();
        let factory = TabularWriterFactory::new();
        let consume = factory
            .build_message_consumer(&evaluation(), directory.path())
            .unwrap();

        let result = consume(&message(
            "DRRC2",
            1,
            vec![
                Statistic::new("MEAN_ERROR", "0-6h", 0.5),
                Statistic::new("", "0-6h", 0.5),
            ],
        ));

        assert!(result.unwrap_err().is_recoverable());
        assert_eq!(std::fs::read_dir(directory.path()).unwrap().count(), 0);
    }

    #[test]
    fn quote_fields_with_separators() {
        assert_eq!(escape("0-6h"), "0-6h");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn flush_open_files_on_close() {
        let directory = tempfile::tempdir().unwrap();
        let factory = TabularWriterFactory::new();
        let consume = factory
            .build_message_consumer(&evaluation(), directory.path())
            .unwrap();

        consume(&message("A", 1, vec![Statistic::new("MEAN_ERROR", "0-6h", 2.0)])).unwrap();
        factory.close().unwrap();

        let content = std::fs::read_to_string(directory.path().join("A_MEAN_ERROR.csv")).unwrap();
        assert!(content.ends_with("A,1,MEAN_ERROR,0-6h,2,,CMS\n"));
    }

    #[test]
    fn close_without_prior_use() {
        assert!(TabularWriterFactory::new().close().is_ok());
    }
}
