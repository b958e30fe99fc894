use super::artifact_path;
use crate::domain::{ConsumerDescription, EvaluationDescriptor, Format, StatisticsMessage};
use crate::module::subscriber::{Artifacts, ConsumerError, ConsumerFactory, GroupConsumer, MessageConsumer};
use bson::{doc, Bson, Document};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Appends one self-describing BSON document per statistics batch and metric
///
/// Files are opened for every write so nothing has to be released when a group completes.
pub struct BinaryWriterFactory {
    description: ConsumerDescription,
}

impl BinaryWriterFactory {
    /// Creates a factory with a fresh consumer identity
    pub fn new() -> Self {
        Self {
            description: ConsumerDescription::new(vec![Format::Binary]),
        }
    }
}

impl Default for BinaryWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerFactory for BinaryWriterFactory {
    fn describe(&self) -> ConsumerDescription {
        self.description.clone()
    }

    fn build_message_consumer(
        &self,
        evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<MessageConsumer, ConsumerError> {
        let evaluation = evaluation.clone();
        let directory = output_dir.to_owned();

        Ok(Arc::new(move |message: &StatisticsMessage| {
            write(&evaluation, &directory, message)
        }))
    }

    fn build_group_consumer(
        &self,
        _evaluation: &Arc<EvaluationDescriptor>,
        output_dir: &Path,
    ) -> Result<GroupConsumer, ConsumerError> {
        let directory = output_dir.to_owned();

        Ok(Arc::new(move |messages: &[StatisticsMessage]| {
            let mut artifacts = Artifacts::new();

            for message in messages {
                for metric in message.metrics() {
                    let path = artifact_path(&directory, &message.group_id, metric, "bson")?;
                    if path.exists() {
                        artifacts.insert(path);
                    }
                }
            }

            Ok(artifacts)
        }))
    }
}

fn write(
    evaluation: &EvaluationDescriptor,
    directory: &Path,
    message: &StatisticsMessage,
) -> Result<Artifacts, ConsumerError> {
    let paths = message
        .metrics()
        .into_iter()
        .map(|metric| Ok((metric, artifact_path(directory, &message.group_id, metric, "bson")?)))
        .collect::<Result<Vec<(&str, PathBuf)>, ConsumerError>>()?;

    let mut artifacts = Artifacts::new();

    for (metric, path) in paths {
        let document = encode(evaluation, message, metric);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(ConsumerError::unrecoverable)?;

        document
            .to_writer(&mut file)
            .map_err(ConsumerError::unrecoverable)?;

        trace!(path = %path.display(), sequence = message.sequence, "Appended binary record");
        artifacts.insert(path);
    }

    Ok(artifacts)
}

fn encode(evaluation: &EvaluationDescriptor, message: &StatisticsMessage, metric: &str) -> Document {
    let statistics: Vec<Bson> = message
        .statistics
        .iter()
        .filter(|statistic| statistic.metric == metric)
        .map(|statistic| {
            let sample_size = match statistic.sample_size {
                Some(size) => Bson::Int64(size as i64),
                None => Bson::Null,
            };

            Bson::Document(doc! {
                "pool": statistic.pool.as_str(),
                "value": statistic.value,
                "sample_size": sample_size,
            })
        })
        .collect();

    doc! {
        "evaluation_id": message.evaluation_id.as_str(),
        "group_id": message.group_id.as_str(),
        "sequence": message.sequence as i64,
        "metric": metric,
        "variable": evaluation.measurement.variable.as_str(),
        "unit": evaluation.measurement.unit.as_str(),
        "statistics": statistics,
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::domain::{MeasurementMetadata, Statistic};
    use pretty_assertions::assert_eq;
    use std::fs::File;

    fn evaluation() -> Arc<EvaluationDescriptor> {
        Arc::new(
            EvaluationDescriptor::new(
                vec![Format::Binary],
                MeasurementMetadata {
                    variable: "streamflow".into(),
                    unit: "CMS".into(),
                    labels: Default::default(),
                },
            )
            .with_id("e1"),
        )
    }

    fn message(sequence: u64, statistics: Vec<Statistic>) -> StatisticsMessage {
        StatisticsMessage {
            evaluation_id: "e1".into(),
            group_id: "DRRC2".into(),
            sequence,
            statistics,
        }
    }

    #[test]
    fn append_one_document_per_batch_and_metric() {
        let directory = tempfile::tempdir().unwrap();
        let factory = BinaryWriterFactory::new();
        let consume = factory
            .build_message_consumer(&evaluation(), directory.path())
            .unwrap();

        let mut sized = Statistic::new("MEAN_ERROR", "0-6h", 0.5);
        sized.sample_size = Some(12);
        let first = message(1, vec![sized, Statistic::new("MEAN_ERROR", "6-12h", 0.7)]);
        let second = message(2, vec![Statistic::new("MEAN_ERROR", "12-18h", f64::NAN)]);

        consume(&first).unwrap();
        let written = consume(&second).unwrap();

        let path = directory.path().join("DRRC2_MEAN_ERROR.bson");
        assert_eq!(written, vec![path.clone()].into_iter().collect::<Artifacts>());

        let mut file = File::open(path).unwrap();
        let first_document = Document::from_reader(&mut file).unwrap();
        let second_document = Document::from_reader(&mut file).unwrap();

        assert_eq!(first_document.get_str("unit").unwrap(), "CMS");
        assert_eq!(first_document.get_i64("sequence").unwrap(), 1);
        assert_eq!(first_document.get_array("statistics").unwrap().len(), 2);
        assert_eq!(second_document.get_i64("sequence").unwrap(), 2);
    }

    #[test]
    fn report_group_files() {
        let directory = tempfile::tempdir().unwrap();
        let factory = BinaryWriterFactory::new();
        let consume = factory
            .build_message_consumer(&evaluation(), directory.path())
            .unwrap();
        let finish = factory
            .build_group_consumer(&evaluation(), directory.path())
            .unwrap();

        let batch = message(
            1,
            vec![
                Statistic::new("MEAN_ERROR", "0-6h", 0.5),
                Statistic::new("BIAS_FRACTION", "0-6h", 0.1),
            ],
        );
        consume(&batch).unwrap();

        assert_eq!(
            finish(&[batch][..]).unwrap(),
            vec![
                directory.path().join("DRRC2_BIAS_FRACTION.bson"),
                directory.path().join("DRRC2_MEAN_ERROR.bson"),
            ]
            .into_iter()
            .collect::<Artifacts>()
        );
    }
}
