use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use jobctl::engine::{FolderImportJob, Job, JobCatalog, JobContext, SimulatedJob, SimulatedJobConfig};
use jobctl::error::{ChannelError, StartError};
use jobctl::listener::RunWatch;
use jobctl::model::{DatasetSummary, Rejection, RunCategory, RunDescriptor, RunEvent, StopAck};
use jobctl::orchestrator::{launch, ControllerOptions, RunClient};
use jobctl::progress::ProgressView;
use jobctl::session::{NoticeLevel, RunPhase, RunSession};

enum Step {
    Progress(u64, u64),
    Finish,
    Fail(&'static str),
}

/// A job that does exactly what the test tells it to.
struct ScriptedJob {
    script: Mutex<Option<mpsc::UnboundedReceiver<Step>>>,
}

fn scripted() -> (ScriptedJob, mpsc::UnboundedSender<Step>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedJob {
            script: Mutex::new(Some(rx)),
        },
        tx,
    )
}

#[async_trait]
impl Job for ScriptedJob {
    async fn execute(&self, mut ctx: JobContext) -> Result<()> {
        let Some(mut script) = self.script.lock().take() else {
            bail!("script already used");
        };
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                step = script.recv() => match step {
                    Some(Step::Progress(current, total)) => {
                        ctx.progress.report(current, total);
                    }
                    Some(Step::Finish) | None => return Ok(()),
                    Some(Step::Fail(msg)) => bail!(msg),
                },
            }
        }
    }
}

async fn next(watch: &mut RunWatch, session: &mut RunSession) -> RunEvent {
    let ev = watch.recv().await.expect("watch closed");
    session.apply(&ev).expect("protocol violation");
    ev
}

fn training_client() -> (RunClient, mpsc::UnboundedSender<Step>) {
    let (job, script) = scripted();
    let catalog = JobCatalog::new().with(RunCategory::TrainingRun, job);
    let (client, _handle) = launch(catalog, ControllerOptions::default());
    (client, script)
}

#[tokio::test]
async fn training_run_streams_progress_then_finishes() {
    let (client, script) = training_client();
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);
    let run = RunDescriptor::new(7, RunCategory::TrainingRun);

    session.start(&client, &watch, run).unwrap();
    assert_eq!(session.phase(), RunPhase::Requesting);

    assert_eq!(next(&mut watch, &mut session).await, RunEvent::Started { run });
    assert_eq!(session.running(), Some(run));
    assert_eq!(client.active_run(), Some(run));

    script.send(Step::Progress(10, 100)).unwrap();
    next(&mut watch, &mut session).await;
    assert_eq!(session.progress(), ProgressView::Ratio(10.0));

    script.send(Step::Progress(55, 100)).unwrap();
    next(&mut watch, &mut session).await;

    script.send(Step::Finish).unwrap();
    assert_eq!(next(&mut watch, &mut session).await, RunEvent::Finished);

    assert_eq!(client.active_run(), None);
    assert_eq!(session.running(), None);
    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(session.progress(), ProgressView::Hidden);
    assert_eq!(session.last_ratio(), Some(55.0));
}

#[tokio::test]
async fn second_run_is_refused_while_one_is_active() {
    let (job, _script) = scripted();
    let catalog = JobCatalog::new()
        .with(RunCategory::TrainingRun, job)
        .with(
            RunCategory::CleaningRun,
            SimulatedJob::new(SimulatedJobConfig::default()),
        );
    let (client, _handle) = launch(catalog, ControllerOptions::default());

    let training_scope = client.enter_context("training screen");
    let mut training_watch = client.subscribe_to_run(&training_scope, RunCategory::TrainingRun);
    let mut training = RunSession::new(RunCategory::TrainingRun);
    let active = RunDescriptor::new(7, RunCategory::TrainingRun);
    training.start(&client, &training_watch, active).unwrap();
    next(&mut training_watch, &mut training).await;

    let cleaning_scope = client.enter_context("cleaning screen");
    let cleaning_watch = client.subscribe_to_run(&cleaning_scope, RunCategory::CleaningRun);
    let mut cleaning = RunSession::new(RunCategory::CleaningRun);
    let err = cleaning
        .start(&client, &cleaning_watch, RunDescriptor::new(3, RunCategory::CleaningRun))
        .unwrap_err();

    assert_eq!(err, StartError::AlreadyRunning { active });
    assert_eq!(cleaning.phase(), RunPhase::Idle);
    assert_eq!(cleaning.notices().len(), 1);
    assert_eq!(cleaning.notices()[0].title, "Another run is active");
    assert_eq!(client.active_run(), Some(active));
    assert_eq!(training.running(), Some(active));
}

#[tokio::test]
async fn precondition_rejection_never_starts() {
    let catalog = JobCatalog::new().with(
        RunCategory::TrainingRun,
        SimulatedJob::new(SimulatedJobConfig {
            dataset: DatasetSummary {
                speakers: 1,
                samples: 40,
            },
            ..Default::default()
        }),
    );
    let (client, _handle) = launch(catalog, ControllerOptions::default());
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);

    session
        .start(&client, &watch, RunDescriptor::new(9, RunCategory::TrainingRun))
        .unwrap();
    assert_eq!(
        next(&mut watch, &mut session).await,
        RunEvent::Rejected {
            reason: Rejection::NotEnoughSpeakers
        }
    );

    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(client.active_run(), None);
    assert_eq!(session.notices()[0].level, NoticeLevel::Warning);
    assert!(watch.try_recv().is_none());
}

#[tokio::test]
async fn stop_without_active_run_is_a_no_op() {
    let (client, _script) = training_client();
    assert_eq!(client.stop_run().await, Ok(StopAck::Idle));
    assert_eq!(client.stop_run().await, Ok(StopAck::Idle));
    assert_eq!(client.active_run(), None);
}

#[tokio::test]
async fn stop_clears_running_state_on_acknowledgement() {
    let (client, _script) = training_client();
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);
    let run = RunDescriptor::new(12, RunCategory::TrainingRun);
    session.start(&client, &watch, run).unwrap();
    next(&mut watch, &mut session).await;

    assert!(session.begin_stop());
    let ack = client.stop_run().await.unwrap();
    assert_eq!(ack, StopAck::Stopped(run));
    assert_eq!(client.active_run(), None);

    // The terminal event was published before the acknowledgement.
    assert_eq!(next(&mut watch, &mut session).await, RunEvent::Stopped);
    assert_eq!(session.phase(), RunPhase::Terminating);
    session.finish_stop(ack);
    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(session.running(), None);
}

/// Ignores cancellation until the test lets it go.
struct SlowToStopJob {
    release: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
}

#[async_trait]
impl Job for SlowToStopJob {
    async fn execute(&self, _ctx: JobContext) -> Result<()> {
        let Some(release) = self.release.lock().take() else {
            bail!("job already ran");
        };
        let _ = release.await;
        Ok(())
    }
}

#[tokio::test]
async fn timed_out_stop_ends_on_terminal_event() {
    let (release_tx, release_rx) = tokio::sync::oneshot::channel();
    let job = SlowToStopJob {
        release: Mutex::new(Some(release_rx)),
    };
    let catalog = JobCatalog::new().with(RunCategory::TrainingRun, job);
    let (client, _handle) = launch(
        catalog,
        ControllerOptions {
            stop_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);
    let run = RunDescriptor::new(13, RunCategory::TrainingRun);
    session.start(&client, &watch, run).unwrap();
    next(&mut watch, &mut session).await;

    assert!(session.begin_stop());
    let err = client.stop_run().await.unwrap_err();
    session.stop_failed(&err);
    assert_eq!(session.phase(), RunPhase::Terminating);
    assert_eq!(client.active_run(), Some(run));

    release_tx.send(()).unwrap();
    assert_eq!(next(&mut watch, &mut session).await, RunEvent::Stopped);
    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(session.running(), None);
    assert_eq!(client.active_run(), None);
}

#[tokio::test]
async fn runtime_failure_surfaces_message() {
    let (client, script) = training_client();
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);
    session
        .start(&client, &watch, RunDescriptor::new(1, RunCategory::TrainingRun))
        .unwrap();
    next(&mut watch, &mut session).await;

    script.send(Step::Fail("out of memory")).unwrap();
    assert_eq!(
        next(&mut watch, &mut session).await,
        RunEvent::Error {
            message: "out of memory".into()
        }
    );
    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(session.notices()[0].description, "out of memory");
    assert_eq!(client.active_run(), None);
}

#[tokio::test]
async fn unsubscribed_context_sees_nothing() {
    let (client, script) = training_client();
    let session = RunSession::new(RunCategory::TrainingRun);
    let scope = client.enter_context("training screen");
    let watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    client.unsubscribe(watch);

    assert_eq!(
        client
            .bus()
            .publish("training-run-reply", RunEvent::Finished),
        Err(ChannelError::NoListener {
            channel: "training-run-reply"
        })
    );
    assert_eq!(session.phase(), RunPhase::Idle);
    assert_eq!(session.progress(), ProgressView::Hidden);
    drop(script);
}

#[tokio::test]
async fn remounted_context_resyncs_with_running_job() {
    let (client, script) = training_client();
    let run = RunDescriptor::new(21, RunCategory::TrainingRun);
    {
        let scope = client.enter_context("training screen");
        let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
        let mut session = RunSession::new(RunCategory::TrainingRun);
        session.start(&client, &watch, run).unwrap();
        next(&mut watch, &mut session).await;
        // Leaving the screen tears down observation only.
    }
    assert_eq!(client.active_run(), Some(run));

    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);
    let mut session = RunSession::new(RunCategory::TrainingRun);
    session.resync(client.active_run());
    assert_eq!(session.phase(), RunPhase::Active);
    assert_eq!(session.running(), Some(run));

    script.send(Step::Progress(3, 4)).unwrap();
    next(&mut watch, &mut session).await;
    assert_eq!(session.progress().percent(), Some(75.0));

    script.send(Step::Finish).unwrap();
    assert_eq!(next(&mut watch, &mut session).await, RunEvent::Finished);
    assert_eq!(session.running(), None);
}

#[tokio::test]
async fn import_events_arrive_in_protocol_order() {
    let root = tempfile::tempdir().unwrap();
    for name in ["a.wav", "b.wav", "c.wav", "d.wav"] {
        std::fs::write(root.path().join(name), b"x").unwrap();
    }
    let catalog = JobCatalog::new().with(
        RunCategory::BulkImport,
        FolderImportJob::new(vec![root.path().to_path_buf()]),
    );
    let (client, handle) = launch(catalog, ControllerOptions::default());
    let scope = client.enter_context("import dialog");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::BulkImport);
    let mut session = RunSession::new(RunCategory::BulkImport);
    let run = RunDescriptor::new(5, RunCategory::BulkImport);
    session.start(&client, &watch, run).unwrap();

    let mut events = Vec::new();
    loop {
        let ev = next(&mut watch, &mut session).await;
        let done = ev.is_terminal();
        events.push(ev);
        if done {
            break;
        }
    }

    assert_eq!(events.first(), Some(&RunEvent::Started { run }));
    assert_eq!(events.last(), Some(&RunEvent::Finished));
    let currents: Vec<u64> = events
        .iter()
        .filter_map(|ev| match ev {
            RunEvent::Progress { current, total } => {
                assert_eq!(*total, 4);
                Some(*current)
            }
            _ => None,
        })
        .collect();
    assert_eq!(currents, vec![0, 1, 2, 3, 4]);
    assert_eq!(events.iter().filter(|ev| ev.is_terminal()).count(), 1);
    assert_eq!(session.last_ratio(), Some(100.0));

    assert!(client.shutdown());
    handle.await.unwrap().unwrap();
    assert!(watch.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_requests_admit_exactly_one_run() {
    let (job, script) = scripted();
    let catalog = JobCatalog::new().with(RunCategory::TrainingRun, job);
    let (client, _handle) = launch(catalog, ControllerOptions::default());
    let scope = client.enter_context("training screen");
    let mut watch = client.subscribe_to_run(&scope, RunCategory::TrainingRun);

    let mut sent = 0;
    let mut fast_failed = 0;
    for id in 0..8 {
        match client.start_run(&watch, RunDescriptor::new(id, RunCategory::TrainingRun)) {
            Ok(()) => sent += 1,
            Err(StartError::AlreadyRunning { .. }) => fast_failed += 1,
            Err(e) => panic!("unexpected start error {e}"),
        }
    }

    let mut started = 0;
    let mut rejected = 0;
    while started + rejected < sent {
        match watch.recv().await.unwrap() {
            RunEvent::Started { .. } => started += 1,
            RunEvent::Rejected {
                reason: Rejection::AlreadyRunning { .. },
            } => rejected += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(rejected + fast_failed, 7);
    assert!(client.active_run().is_some());
    drop(script);
}
