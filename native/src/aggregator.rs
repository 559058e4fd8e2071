//! Poll loop driving the port models and the host record.

use crate::channel::PluginChannel;
use crate::port::Thresholds;
use crate::record::{
    truncate_to_bound, ErrorSeverity, Operation, PluginStatus, ValidationError, MAX_ERROR_TEXT,
};
use crate::sampling::PortSampler;
use crate::shm::AttachError;
use crate::table::PortTable;
use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Complete,
}

/// How a polling session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every port reached its thresholds.
    Passed,
    /// The host stopped the test before every port passed.
    Stopped,
    /// Shut down from our side (e.g. Ctrl+C).
    Interrupted,
}

/// Work done in one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TickWork {
    port: u32,
    power_sampled: bool,
}

pub struct Aggregator {
    table: PortTable,
    cursor: usize,
    warned_empty: bool,
}

impl Aggregator {
    pub fn new(table: PortTable) -> Self {
        Self {
            table,
            cursor: 0,
            warned_empty: false,
        }
    }

    pub fn with_ports(ids: impl IntoIterator<Item = u32>, thresholds: Thresholds) -> Self {
        Self::new(PortTable::with_ports(ids, thresholds))
    }

    pub fn table(&self) -> &PortTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut PortTable {
        &mut self.table
    }

    /// Sample the next port in round-robin order and update the record.
    ///
    /// Voltage is always sampled; current and power only once the fresh
    /// voltage meets the threshold. A failed voltage sample skips the tick.
    pub fn tick<S>(&mut self, sampler: &mut S, channel: Option<&mut PluginChannel>) -> TickOutcome
    where
        S: PortSampler + ?Sized,
    {
        let Some(work) = self.sample_next(sampler) else {
            return TickOutcome::Continue;
        };

        if let Some(channel) = channel {
            channel.increment_cycle();
            channel.count_operations(Operation::Read, 1);
            channel.count_operations(Operation::Verify, i64::from(work.power_sampled));
        }

        if self.table.all_passing() {
            info!(
                "[AGGREGATOR] All {} ports passing (last sampled LAN {})",
                self.table.len(),
                work.port
            );
            TickOutcome::Complete
        } else {
            TickOutcome::Continue
        }
    }

    fn sample_next<S>(&mut self, sampler: &mut S) -> Option<TickWork>
    where
        S: PortSampler + ?Sized,
    {
        if self.table.is_empty() {
            if !self.warned_empty {
                warn!("[AGGREGATOR] No ports to sample");
                self.warned_empty = true;
            }
            return None;
        }

        let row = self.cursor % self.table.len();
        self.cursor = (row + 1) % self.table.len();
        let thresholds = *self.table.thresholds();
        let port = self.table.port_at_mut(row)?;
        let id = port.id();

        let voltage = match sampler.sample_voltage(id) {
            Ok(volts) => volts,
            Err(e) => {
                warn!("[AGGREGATOR] Voltage sample failed: {}", e);
                return None;
            }
        };
        port.set_voltage(voltage);

        let mut power_sampled = false;
        if voltage >= thresholds.voltage {
            match sampler.sample_current(id) {
                Ok(amps) => port.set_current(amps),
                Err(e) => warn!("[AGGREGATOR] Current sample failed: {}", e),
            }
            match sampler.sample_power(id) {
                Ok(watts) => {
                    port.set_power(watts);
                    power_sampled = true;
                }
                Err(e) => warn!("[AGGREGATOR] Power sample failed: {}", e),
            }
        }

        debug!(
            "[AGGREGATOR] LAN {}: {:.2}V (max {:.2}V), max {:.2}W",
            id,
            voltage,
            port.max_voltage(),
            port.max_power()
        );

        Some(TickWork {
            port: id,
            power_sampled,
        })
    }

    /// Poll on a fixed interval until every port passes, the host stops the
    /// test, or `shutdown` resolves.
    pub async fn run<S, F>(
        &mut self,
        sampler: &mut S,
        channel: &mut PluginChannel,
        interval: Duration,
        shutdown: F,
    ) -> Result<SessionOutcome, AttachError>
    where
        S: PortSampler + ?Sized,
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut host_started = channel.test_running();
        info!(
            "[AGGREGATOR] Polling {} ports every {:?}",
            self.table.len(),
            interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("[AGGREGATOR] Shutdown requested");
                    return Ok(SessionOutcome::Interrupted);
                }
                _ = ticker.tick() => {}
            }

            channel.verify_segment()?;

            let running = channel.test_running();
            if host_started && !running {
                info!("[AGGREGATOR] Host stopped the test");
                return Ok(SessionOutcome::Stopped);
            }
            host_started |= running;

            if self.tick(sampler, Some(&mut *channel)) == TickOutcome::Complete {
                return Ok(SessionOutcome::Passed);
            }
        }
    }

    /// Publish the final result of a session to the host.
    pub async fn report(
        &self,
        channel: &mut PluginChannel,
        outcome: SessionOutcome,
    ) -> Result<(), ValidationError> {
        match outcome {
            SessionOutcome::Passed => {
                channel
                    .publish_status(PluginStatus::Cleanup, "All ports passing", true)
                    .await?;
                channel.publish_pretest_complete(true).await;
            }
            SessionOutcome::Stopped | SessionOutcome::Interrupted => {
                let failing = self
                    .table
                    .failing_ports()
                    .iter()
                    .map(|id| format!("LAN {}", id))
                    .collect::<Vec<_>>()
                    .join(", ");
                let message = format!("Ports not passing: {}", failing);
                channel
                    .publish_error(
                        ErrorSeverity::Serious,
                        truncate_to_bound(&message, MAX_ERROR_TEXT),
                        false,
                    )
                    .await?;
                channel
                    .publish_status(PluginStatus::Error, "Ports failing", true)
                    .await?;

                if outcome == SessionOutcome::Interrupted {
                    channel.publish_pretest_complete(true).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{Frame, ReplaySampler, SampleError};
    use std::collections::BTreeMap;

    fn thresholds() -> Thresholds {
        Thresholds {
            voltage: 48.0,
            power: 4.5,
        }
    }

    fn replay(ports: &[(u32, Vec<Frame>)]) -> ReplaySampler {
        ReplaySampler::new(ports.iter().cloned().collect::<BTreeMap<_, _>>())
    }

    /// Counts calls so tests can check which samples were taken.
    struct CountingSampler {
        inner: ReplaySampler,
        power_calls: usize,
    }

    impl PortSampler for CountingSampler {
        fn list_port_ids(&mut self) -> Result<Vec<u32>, SampleError> {
            self.inner.list_port_ids()
        }
        fn sample_voltage(&mut self, port: u32) -> Result<f64, SampleError> {
            self.inner.sample_voltage(port)
        }
        fn sample_current(&mut self, port: u32) -> Result<f64, SampleError> {
            self.inner.sample_current(port)
        }
        fn sample_power(&mut self, port: u32) -> Result<f64, SampleError> {
            self.power_calls += 1;
            self.inner.sample_power(port)
        }
    }

    #[test]
    fn scenario_passes_then_stays_passing() {
        let mut sampler = replay(&[(
            1,
            vec![
                Frame::new(45.0, 0.0, 0.0),
                Frame::new(50.0, 0.1, 5.0),
                Frame::new(49.0, 0.0, 0.0),
            ],
        )]);
        let mut aggregator = Aggregator::with_ports([1], thresholds());

        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.table().is_port_passing(1), Some(false));

        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Complete);
        assert_eq!(aggregator.table().is_port_passing(1), Some(true));

        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Complete);
        assert_eq!(aggregator.table().is_port_passing(1), Some(true));
        assert_eq!(aggregator.table().port(1).unwrap().max_power(), 5.0);
    }

    #[test]
    fn power_is_skipped_below_voltage_threshold() {
        let mut sampler = CountingSampler {
            inner: replay(&[(1, vec![Frame::new(30.0, 0.2, 6.0)])]),
            power_calls: 0,
        };
        let mut aggregator = Aggregator::with_ports([1], thresholds());

        aggregator.tick(&mut sampler, None);
        aggregator.tick(&mut sampler, None);

        assert_eq!(sampler.power_calls, 0);
        let port = aggregator.table().port(1).unwrap();
        assert_eq!(port.max_voltage(), 30.0);
        assert_eq!(port.max_power(), 0.0);
        assert_eq!(port.max_current(), 0.0);
    }

    #[test]
    fn ports_are_polled_round_robin() {
        let mut sampler = replay(&[
            (1, vec![Frame::new(10.0, 0.0, 0.0)]),
            (2, vec![Frame::new(20.0, 0.0, 0.0)]),
            (3, vec![Frame::new(30.0, 0.0, 0.0)]),
        ]);
        let mut aggregator = Aggregator::with_ports([1, 2, 3], thresholds());

        aggregator.tick(&mut sampler, None);
        assert_eq!(aggregator.table().port(1).unwrap().voltage(), 10.0);
        assert_eq!(aggregator.table().port(2).unwrap().voltage(), 0.0);

        aggregator.tick(&mut sampler, None);
        aggregator.tick(&mut sampler, None);
        assert_eq!(aggregator.table().port(2).unwrap().voltage(), 20.0);
        assert_eq!(aggregator.table().port(3).unwrap().voltage(), 30.0);
    }

    #[test]
    fn completion_requires_every_port() {
        let mut sampler = replay(&[
            (1, vec![Frame::new(50.0, 0.1, 5.0)]),
            (2, vec![Frame::new(40.0, 0.0, 0.0), Frame::new(52.0, 0.1, 5.0)]),
        ]);
        let mut aggregator = Aggregator::with_ports([1, 2], thresholds());

        // LAN 1 passes on the first tick but LAN 2 has not been seen yet.
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Complete);
    }

    #[test]
    fn failed_sample_leaves_value_unchanged() {
        let mut sampler = replay(&[(
            1,
            vec![Frame::new(47.0, 0.0, 0.0), Frame::fault("bus error")],
        )]);
        let mut aggregator = Aggregator::with_ports([1], thresholds());

        aggregator.tick(&mut sampler, None);
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.table().port(1).unwrap().voltage(), 47.0);
    }

    #[test]
    fn empty_port_set_never_completes() {
        let mut sampler = replay(&[]);
        let mut aggregator = Aggregator::with_ports(Vec::<u32>::new(), thresholds());
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
        assert_eq!(aggregator.tick(&mut sampler, None), TickOutcome::Continue);
    }

    #[cfg(unix)]
    mod with_host {
        use super::*;
        use crate::host::{test_key, HostView};
        use crate::record::EventFlag;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::thread;
        use tokio::time::timeout;

        fn attach(tag: &str) -> (HostView, PluginChannel) {
            let key = test_key(tag);
            let host = HostView::create(&key).unwrap();
            let channel = PluginChannel::attach(&key, "PoE").unwrap();
            (host, channel)
        }

        #[test]
        fn counters_reflect_power_sample() {
            let (host, mut channel) = attach("agg1");
            let mut sampler = replay(&[(1, vec![Frame::new(50.0, 0.1, 5.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());

            aggregator.tick(&mut sampler, Some(&mut channel));

            let snap = host.snapshot();
            assert_eq!(snap.cycle, 1);
            assert_eq!(snap.read.count, 1);
            assert_eq!(snap.verify.count, 1);
            assert_eq!(snap.write.count, -1);
        }

        #[test]
        fn counters_reflect_skipped_power_sample() {
            let (host, mut channel) = attach("agg2");
            let mut sampler = replay(&[(1, vec![Frame::new(45.0, 0.0, 0.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());

            aggregator.tick(&mut sampler, Some(&mut channel));

            let snap = host.snapshot();
            assert_eq!(snap.cycle, 1);
            assert_eq!(snap.read.count, 1);
            assert_eq!(snap.verify.count, 0);
            assert_eq!(snap.write.count, -1);
        }

        #[test]
        fn failed_tick_does_not_count() {
            let (host, mut channel) = attach("agg3");
            let mut sampler = replay(&[(1, vec![Frame::fault("no PSE")])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());

            aggregator.tick(&mut sampler, Some(&mut channel));

            let snap = host.snapshot();
            assert_eq!(snap.cycle, 0);
            assert_eq!(snap.read.count, -1);
            assert_eq!(snap.verify.count, -1);
        }

        #[tokio::test]
        async fn run_finishes_when_all_ports_pass() {
            let (host, mut channel) = attach("run1");
            host.set_test_running(true);
            let mut sampler = replay(&[
                (1, vec![Frame::new(40.0, 0.0, 0.0), Frame::new(50.0, 0.1, 5.0)]),
                (2, vec![Frame::new(51.0, 0.1, 4.6)]),
            ]);
            let mut aggregator = Aggregator::with_ports([1, 2], thresholds());

            let outcome = timeout(
                Duration::from_secs(5),
                aggregator.run(
                    &mut sampler,
                    &mut channel,
                    Duration::from_millis(1),
                    std::future::pending(),
                ),
            )
            .await
            .expect("run should complete")
            .unwrap();

            assert_eq!(outcome, SessionOutcome::Passed);
            assert_eq!(host.snapshot().cycle, 3);
        }

        #[tokio::test]
        async fn run_stops_when_host_stops() {
            let (host, mut channel) = attach("run2");
            host.set_test_running(true);
            let mut sampler = replay(&[(1, vec![Frame::new(20.0, 0.0, 0.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());

            let stopper = thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                host.set_test_running(false);
                host
            });

            let outcome = timeout(
                Duration::from_secs(5),
                aggregator.run(
                    &mut sampler,
                    &mut channel,
                    Duration::from_millis(1),
                    std::future::pending(),
                ),
            )
            .await
            .expect("run should notice the host stopping")
            .unwrap();

            assert_eq!(outcome, SessionOutcome::Stopped);
            let host = stopper.join().unwrap();
            assert!(host.snapshot().cycle > 0);
        }

        #[tokio::test]
        async fn run_honours_shutdown() {
            let (_host, mut channel) = attach("run3");
            let mut sampler = replay(&[(1, vec![Frame::new(20.0, 0.0, 0.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());

            let outcome = aggregator
                .run(
                    &mut sampler,
                    &mut channel,
                    Duration::from_millis(1),
                    tokio::time::sleep(Duration::from_millis(20)),
                )
                .await
                .unwrap();
            assert_eq!(outcome, SessionOutcome::Interrupted);
        }

        #[tokio::test]
        async fn run_fails_when_segment_disappears() {
            let (host, mut channel) = attach("run4");
            let mut sampler = replay(&[(1, vec![Frame::new(20.0, 0.0, 0.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());
            drop(host);

            let result = aggregator
                .run(
                    &mut sampler,
                    &mut channel,
                    Duration::from_millis(1),
                    std::future::pending(),
                )
                .await;
            assert!(matches!(result, Err(AttachError::SegmentGone(_))));
        }

        #[tokio::test]
        async fn released_segment_with_pending_events_does_not_block() {
            let (host, mut channel) = attach("run5");
            host.set_test_running(true);
            channel
                .publish_status(PluginStatus::Reading, "Polling", false)
                .await
                .unwrap();
            channel
                .publish_error(ErrorSeverity::Warning, "slow PSE", false)
                .await
                .unwrap();
            drop(host);

            let mut sampler = replay(&[(1, vec![Frame::new(20.0, 0.0, 0.0)])]);
            let mut aggregator = Aggregator::with_ports([1], thresholds());
            let result = timeout(
                Duration::from_secs(5),
                aggregator.run(
                    &mut sampler,
                    &mut channel,
                    Duration::from_millis(1),
                    std::future::pending(),
                ),
            )
            .await
            .expect("run should notice the released segment");
            assert!(matches!(result, Err(AttachError::SegmentGone(_))));

            timeout(Duration::from_secs(5), channel.close())
                .await
                .expect("close must not wait on a released segment");
        }

        #[tokio::test]
        async fn report_names_failing_ports() {
            let (host, mut channel) = attach("rep1");
            let mut aggregator = Aggregator::with_ports([1, 2], thresholds());
            {
                let port = aggregator.table_mut().port_mut(1).unwrap();
                port.set_voltage(50.0);
                port.set_power(5.0);
            }

            aggregator
                .report(&mut channel, SessionOutcome::Stopped)
                .await
                .unwrap();

            let snap = host.snapshot();
            assert_eq!(snap.error_message, "Ports not passing: LAN 2");
            assert_eq!(snap.error_count, 1);
            assert_eq!(snap.status, PluginStatus::Error.code());
            assert_eq!(snap.status_message, "Ports failing");
        }

        #[tokio::test]
        async fn report_success_ends_with_pretest_complete() {
            let (host, mut channel) = attach("rep2");
            host.set_test_running(true);
            let stop = Arc::new(AtomicBool::new(false));
            let flag_stop = Arc::clone(&stop);
            let acker = thread::spawn(move || {
                let mut statuses = Vec::new();
                while !flag_stop.load(Ordering::Relaxed) {
                    if host.is_raised(EventFlag::Status) {
                        statuses.push(host.snapshot().status);
                        host.acknowledge(EventFlag::Status);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                statuses
            });

            let aggregator = Aggregator::with_ports([1], thresholds());
            timeout(
                Duration::from_secs(5),
                aggregator.report(&mut channel, SessionOutcome::Passed),
            )
            .await
            .expect("report should be acknowledged")
            .unwrap();

            stop.store(true, Ordering::Relaxed);
            let statuses = acker.join().unwrap();
            assert_eq!(
                statuses,
                vec![
                    PluginStatus::Cleanup.code(),
                    PluginStatus::PretestCompleted.code()
                ]
            );
        }
    }
}
