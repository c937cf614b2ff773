//! Time-series driver: pairs consecutive base fields and estimates motion
//! between each pair.

use crate::core::estimator::{EstimatorParams, MotionEstimate, MotionFieldEstimator};
use crate::params::{LatestDataParams, TrackerParams, TriggerMode};
use crate::types::{ScalarField, VetError, VetResult};
use anyhow::Context;
use chrono::{DateTime, Utc};

/// Supplies base fields by time
pub trait FieldSource {
    /// Read the field closest to `time`; `Ok(None)` when nothing matches
    fn read_base_field(&mut self, time: DateTime<Utc>) -> VetResult<Option<ScalarField>>;

    /// Times with data available in `[start, end]`
    fn available_times(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> VetResult<Vec<DateTime<Utc>>>;

    /// Time of the newest field, if any
    fn latest_time(&self) -> VetResult<Option<DateTime<Utc>>> {
        Ok(self
            .available_times(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)?
            .into_iter()
            .max())
    }
}

/// Receives estimated motion fields
pub trait VectorSink {
    fn write_vector_field(&mut self, estimate: &MotionEstimate) -> VetResult<()>;
}

/// Result of handing one field to the tracker
#[derive(Debug)]
pub enum PairingOutcome {
    /// No previous field yet; this one is kept for the next pairing
    Buffered,
    Estimated(MotionEstimate),
    /// The pairing failed; the new field is still kept as the next previous
    Skipped(VetError),
}

/// Counters for one run over a time series
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub fields_read: usize,
    pub read_failures: usize,
    pub pairings_estimated: usize,
    pub pairings_converged: usize,
    pub pairings_skipped: usize,
    pub outputs_written: usize,
    pub write_failures: usize,
}

impl TrackerStats {
    /// Pairings that produced no output
    pub fn failed_pairings(&self) -> usize {
        self.pairings_skipped + self.write_failures
    }
}

/// Fires once for each newest field time it has not seen before.
///
/// Fields that arrive and are superseded between two polls are never
/// reported.
#[derive(Debug, Clone)]
pub struct LatestDataTrigger {
    poll_interval: std::time::Duration,
    last: Option<DateTime<Utc>>,
}

impl LatestDataTrigger {
    pub fn new(poll_interval: std::time::Duration) -> Self {
        Self {
            poll_interval,
            last: None,
        }
    }

    pub fn from_params(params: &LatestDataParams) -> Self {
        Self::new(std::time::Duration::from_secs(params.poll_interval_secs))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        self.poll_interval
    }

    /// Last time handed out
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Newest field time in `source`, when it is newer than the last one returned
    pub fn poll<S: FieldSource + ?Sized>(&mut self, source: &S) -> VetResult<Option<DateTime<Utc>>> {
        let latest = match source.latest_time()? {
            Some(latest) => latest,
            None => return Ok(None),
        };

        if self.last.map_or(true, |last| latest > last) {
            self.last = Some(latest);
            Ok(Some(latest))
        } else {
            Ok(None)
        }
    }
}

/// Echo tracker owning one estimator and the buffered previous field
pub struct EchoTracker {
    estimator: MotionFieldEstimator,
    prev: Option<ScalarField>,
    stats: TrackerStats,
}

impl EchoTracker {
    pub fn new(params: EstimatorParams) -> Self {
        Self {
            estimator: MotionFieldEstimator::with_params(params),
            prev: None,
            stats: TrackerStats::default(),
        }
    }

    pub fn from_params(params: &TrackerParams) -> Self {
        Self::new(EstimatorParams::from(params))
    }

    pub fn estimator(&self) -> &MotionFieldEstimator {
        &self.estimator
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn previous(&self) -> Option<&ScalarField> {
        self.prev.as_ref()
    }

    /// Drop the buffered field so the next one starts a new series
    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Pair `field` with the buffered previous field and estimate motion.
    ///
    /// Whatever the outcome, `field` becomes the previous field for the next call.
    pub fn process_field(&mut self, field: ScalarField) -> PairingOutcome {
        let prev = match self.prev.take() {
            Some(prev) => prev,
            None => {
                log::info!("Buffering first field at {}", field.timestamp);
                self.prev = Some(field);
                return PairingOutcome::Buffered;
            }
        };

        let curr_time = field.timestamp;
        let result = self.estimator.estimate(&prev, &field);
        self.prev = Some(field);

        match result {
            Ok(estimate) => {
                self.stats.pairings_estimated += 1;
                if estimate.converged() {
                    self.stats.pairings_converged += 1;
                }
                PairingOutcome::Estimated(estimate)
            }
            Err(e) => {
                log::warn!(
                    "Skipping pairing {} -> {}: {}",
                    prev.timestamp, curr_time, e
                );
                self.stats.pairings_skipped += 1;
                PairingOutcome::Skipped(e)
            }
        }
    }

    /// Read the field at `time`, pair it and write any estimate to `sink`.
    ///
    /// A failed or empty read breaks the series: the buffered field is
    /// discarded so no pairing spans the gap.
    fn process_time<S, K>(&mut self, source: &mut S, sink: &mut K, time: DateTime<Utc>)
    where
        S: FieldSource,
        K: VectorSink,
    {
        let field = match source.read_base_field(time) {
            Ok(Some(field)) => field,
            Ok(None) => {
                log::warn!("No base field found for {}", time);
                self.stats.read_failures += 1;
                self.reset();
                return;
            }
            Err(e) => {
                log::error!("Failed to read base field for {}: {}", time, e);
                self.stats.read_failures += 1;
                self.reset();
                return;
            }
        };
        self.stats.fields_read += 1;

        if let PairingOutcome::Estimated(estimate) = self.process_field(field) {
            match sink.write_vector_field(&estimate) {
                Ok(()) => self.stats.outputs_written += 1,
                Err(e) => {
                    log::error!("Failed to write motion field for {}: {}", estimate.valid_time(), e);
                    self.stats.write_failures += 1;
                }
            }
        }
    }

    fn start_series(&mut self) {
        self.stats = TrackerStats::default();
        self.prev = None;
    }

    fn finish_series(&self, requested: &str) -> anyhow::Result<TrackerStats> {
        if self.stats.fields_read == 0 {
            anyhow::bail!("No base fields could be read for {}", requested);
        }

        if self.stats.failed_pairings() > 0 {
            log::warn!(
                "{} of {} pairings produced no output",
                self.stats.failed_pairings(),
                self.stats.pairings_estimated + self.stats.pairings_skipped
            );
        }
        log::info!(
            "Processed {} fields, wrote {} motion fields",
            self.stats.fields_read,
            self.stats.outputs_written
        );

        Ok(self.stats.clone())
    }

    /// Process the fields at `times` in order, writing every estimate to `sink`.
    ///
    /// Fails only when no field at all could be read.
    pub fn run<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        times: &[DateTime<Utc>],
    ) -> anyhow::Result<TrackerStats>
    where
        S: FieldSource,
        K: VectorSink,
    {
        self.start_series();
        for &time in times {
            self.process_time(source, sink, time);
        }
        self.finish_series(&format!("{} requested times", times.len()))
    }

    /// Poll `source` and process each new latest field as it appears.
    ///
    /// Sleeps for the trigger's poll interval whenever nothing new arrived.
    /// Stops after `max_polls` polls, or never when it is `None`. Listing
    /// errors are logged and retried on the next poll.
    pub fn run_latest<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        trigger: &mut LatestDataTrigger,
        max_polls: Option<usize>,
    ) -> anyhow::Result<TrackerStats>
    where
        S: FieldSource,
        K: VectorSink,
    {
        self.start_series();
        log::info!("Waiting for new base fields (poll every {:?})", trigger.poll_interval());

        let mut polls = 0;
        while max_polls.map_or(true, |max| polls < max) {
            polls += 1;
            match trigger.poll(&*source) {
                Ok(Some(time)) => {
                    log::info!("New base field at {}", time);
                    self.process_time(source, sink, time);
                    continue;
                }
                Ok(None) => log::debug!("No new base field after poll {}", polls),
                Err(e) => log::error!("Failed to check for new base fields: {}", e),
            }
            std::thread::sleep(trigger.poll_interval());
        }

        self.finish_series(&format!("{} polls", polls))
    }

    /// Run in the mode `params.trigger_mode` selects
    pub fn run_configured<S, K>(
        &mut self,
        params: &TrackerParams,
        source: &mut S,
        sink: &mut K,
    ) -> anyhow::Result<TrackerStats>
    where
        S: FieldSource,
        K: VectorSink,
    {
        match params.trigger_mode {
            TriggerMode::TimeList => {
                let time_list = params
                    .time_list
                    .as_ref()
                    .context("time_list trigger mode needs a time_list")?;
                let (start, end) = (time_list.start()?, time_list.end()?);
                self.run_time_list(source, sink, start, end)
            }
            TriggerMode::LatestData => {
                let mut trigger = LatestDataTrigger::from_params(&params.latest_data);
                self.run_latest(source, sink, &mut trigger, None)
            }
        }
    }

    /// Process every available field time in `[start, end]`, oldest first
    pub fn run_time_list<S, K>(
        &mut self,
        source: &mut S,
        sink: &mut K,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<TrackerStats>
    where
        S: FieldSource,
        K: VectorSink,
    {
        let mut times = source
            .available_times(start, end)
            .with_context(|| format!("Failed to list base fields between {} and {}", start, end))?;
        times.sort();
        times.dedup();

        log::info!("Found {} base field times between {} and {}", times.len(), start, end);
        self.run(source, sink, &times)
    }
}
