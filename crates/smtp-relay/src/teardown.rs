use crate::session::{Session, SessionState, UpstreamState};
use crate::task::TempStaging;

/// Which resources a teardown actually released
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub upstream_finalized: bool,
    pub quit_sent: bool,
    pub upstream_released: bool,
    pub message_unmapped: bool,
    pub recipients_released: bool,
    pub client_released: bool,
    pub temp_unlinked: bool,
    pub temp_closed: bool,
    pub scratch_destroyed: bool,
}

impl Session {
    /// Releases everything the session holds. Each step only runs if
    /// its resource is present, so partially set up sessions are safe.
    /// Returns None if the session was already torn down.
    pub fn teardown(&mut self) -> Option<TeardownReport> {
        if self.torn_down {
            return None;
        }
        self.torn_down = true;
        let mut report = TeardownReport::default();

        if std::mem::take(&mut self.upstream_finalizer) {
            report.upstream_finalized = true;
            self.finalize_upstream_connection(&mut report);
        }

        if let Some(mut task) = self.task.take() {
            report.message_unmapped = task.unmap_message();
            report.recipients_released = task.release_recipients();
        }

        if let Some(client) = self.client.take() {
            client.release();
            report.client_released = true;
        }
        self.client_events.take();

        if let Some(TempStaging { file, path, .. }) = self.staging.take() {
            let temp_name = path.display().to_string();
            match path.close() {
                Ok(()) => report.temp_unlinked = true,
                Err(err) => tracing::warn!("{}: failed to remove {temp_name}: {err}", self.peer),
            }
            drop(file);
            report.temp_closed = true;
        }

        if let Some(scratch) = self.scratch.take() {
            let buffers = scratch.destroy();
            tracing::trace!("{}: scratch pool held {buffers} buffers", self.peer);
            report.scratch_destroyed = true;
        }

        // A failed session keeps CriticalError as its final state
        if self.state != SessionState::CriticalError {
            self.state = SessionState::Terminated;
        }
        tracing::debug!(?report, "{}: session torn down", self.peer);
        Some(report)
    }

    /// Politely ends the upstream transaction if it is still open and
    /// releases the upstream dispatcher
    fn finalize_upstream_connection(&mut self, report: &mut TeardownReport) {
        if let Some(mut upstream) = self.upstream_dispatcher.take() {
            if !self.quit_sent && self.upstream_state != UpstreamState::End {
                let quit = self.line(format_args!("QUIT"));
                match upstream.write(quit, false, false) {
                    Ok(()) => {
                        self.quit_sent = true;
                        report.quit_sent = true;
                    }
                    Err(err) => tracing::debug!("{}: QUIT not sent: {err}", self.peer),
                }
            }
            upstream.release();
            report.upstream_released = true;
        }
        self.upstream_events.take();
        self.upstream_state = UpstreamState::End;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test::{context, staged_task, Call, MockConnector, MockDispatcher, Recorder};
    use crate::session::Side;
    use crate::task::Task;
    use relay_scoring::MetricResult;
    use std::sync::Arc;

    #[test]
    fn empty_session() {
        let recorder = Recorder::default();
        let ctx = context(&["127.0.0.1:2525"], Arc::new(MockConnector::default()));
        let (client, events) = MockDispatcher::new(Side::Client, &recorder);
        let mut session = Session::new(
            ctx,
            "peer",
            Task::new(String::new(), vec![], None),
            None,
            Box::new(client),
            events,
        );

        k9::assert_equal!(
            session.teardown(),
            Some(TeardownReport {
                client_released: true,
                scratch_destroyed: true,
                ..Default::default()
            })
        );
        k9::assert_equal!(session.state(), SessionState::Terminated);
        k9::assert_equal!(session.teardown(), None);
        k9::assert_equal!(recorder.calls(), vec![(Side::Client, Call::Release)]);
    }

    #[tokio::test]
    async fn every_resource_is_released_once() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::default());
        let recorder = connector.recorder.clone();
        let ctx = context(&["127.0.0.1:2525"], connector.clone());
        let (task, staging) = staged_task(
            dir.path(),
            b"Subject: x\r\n\r\nbody\r\n",
            vec![MetricResult::new("default", 0.0)],
        );
        let temp_path = staging.path.to_path_buf();
        let (client, events) = MockDispatcher::new(Side::Client, &recorder);
        let mut session = Session::new(ctx, "peer", task, Some(staging), Box::new(client), events);

        session.create_upstream_connection().await.unwrap();
        let report = session.teardown().unwrap();
        k9::assert_equal!(
            report,
            TeardownReport {
                upstream_finalized: true,
                quit_sent: true,
                upstream_released: true,
                message_unmapped: true,
                recipients_released: true,
                client_released: true,
                temp_unlinked: true,
                temp_closed: true,
                scratch_destroyed: true,
            }
        );
        assert!(!temp_path.exists());
        k9::assert_equal!(session.upstream_state(), UpstreamState::End);

        k9::assert_equal!(session.teardown(), None);
        k9::assert_equal!(
            recorder.calls(),
            vec![
                (
                    Side::Upstream,
                    Call::Write {
                        data: b"QUIT\r\n".to_vec(),
                        close_after: false
                    }
                ),
                (Side::Upstream, Call::Release),
                (Side::Client, Call::Release),
            ]
        );
    }

    #[test]
    fn already_removed_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let ctx = context(&[], Arc::new(MockConnector::default()));
        let (task, staging) = staged_task(dir.path(), b"x", vec![]);
        std::fs::remove_file(&staging.path).unwrap();
        let (client, events) = MockDispatcher::new(Side::Client, &recorder);
        let mut session = Session::new(ctx, "peer", task, Some(staging), Box::new(client), events);

        let report = session.teardown().unwrap();
        assert!(!report.temp_unlinked);
        assert!(report.temp_closed);
        assert!(report.message_unmapped);
    }
}
