use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kapsule::operations::{EventPayload, MessageLevel, OperationSpec, OperationTracker};
use kapsule::pipeline::PipelineContext;
use kapsule::{KapsuleError, PipelineBuilder, ProgressReporter, Step, StepOutcome};

struct Ctx {
    progress: ProgressReporter,
    ran: Arc<Mutex<Vec<&'static str>>>,
}

impl PipelineContext for Ctx {
    fn progress(&self) -> &ProgressReporter {
        &self.progress
    }
}

enum Behaviour {
    Done,
    Warn,
    Fail,
}

struct Probe(&'static str, Behaviour);

#[async_trait]
impl Step<Ctx> for Probe {
    fn name(&self) -> &'static str {
        self.0
    }

    async fn run(&self, ctx: &mut Ctx) -> kapsule::Result<StepOutcome> {
        ctx.ran.lock().unwrap().push(self.0);
        match self.1 {
            Behaviour::Done => Ok(StepOutcome::Done),
            Behaviour::Warn => Ok(StepOutcome::Warn(format!("{} degraded", self.0))),
            Behaviour::Fail => Err(KapsuleError::failed(format!("{} broke", self.0))),
        }
    }
}

fn ctx() -> (Ctx, Arc<Mutex<Vec<&'static str>>>) {
    let ran = Arc::new(Mutex::new(Vec::new()));
    (
        Ctx {
            progress: ProgressReporter::detached(),
            ran: ran.clone(),
        },
        ran,
    )
}

#[tokio::test]
async fn test_steps_run_by_order_then_registration() {
    let mut b = PipelineBuilder::new("probe");
    b.step_at(300, Probe("c", Behaviour::Done))
        .step_at(100, Probe("a", Behaviour::Done))
        .step_at(200, Probe("b1", Behaviour::Done))
        .step_at(200, Probe("b2", Behaviour::Done))
        .step(Probe("default", Behaviour::Done));
    let p = b.build();
    assert_eq!(p.step_names(), vec!["a", "b1", "b2", "c", "default"]);

    let (mut c, ran) = ctx();
    p.run(&mut c).await.unwrap();
    assert_eq!(*ran.lock().unwrap(), vec!["a", "b1", "b2", "c", "default"]);
}

#[tokio::test]
async fn test_fatal_step_stops_the_run_and_surfaces_its_error() {
    let mut b = PipelineBuilder::new("probe");
    b.step_at(100, Probe("first", Behaviour::Done))
        .step_at(200, Probe("boom", Behaviour::Fail))
        .step_at(300, Probe("never", Behaviour::Done));
    let p = b.build();

    let (mut c, ran) = ctx();
    let err = p.run(&mut c).await.unwrap_err();
    assert_eq!(err.to_string(), "boom broke");
    assert_eq!(*ran.lock().unwrap(), vec!["first", "boom"]);
}

#[tokio::test]
async fn test_warning_is_reported_and_run_continues() {
    let mut b = PipelineBuilder::new("probe");
    b.step_at(100, Probe("soft", Behaviour::Warn))
        .step_at(200, Probe("after", Behaviour::Done));
    let p = b.build();

    let tracker = OperationTracker::new();
    let mut events = tracker.subscribe();
    let ran = Arc::new(Mutex::new(Vec::new()));
    let spec = OperationSpec::new("probe", "Probing {name}", "name").arg("name", "x");
    tracker
        .track(spec, |progress| {
            let ran = ran.clone();
            let p = &p;
            async move {
                let mut c = Ctx { progress, ran };
                p.run(&mut c).await
            }
        })
        .await
        .unwrap();

    assert_eq!(*ran.lock().unwrap(), vec!["soft", "after"]);
    let mut warnings = Vec::new();
    let mut stages = Vec::new();
    while let Ok(ev) = events.try_recv() {
        match ev.payload {
            EventPayload::Message {
                level: MessageLevel::Warning,
                text,
                ..
            } => warnings.push(text),
            EventPayload::Stage(s) => stages.push(s),
            _ => {}
        }
    }
    assert_eq!(warnings, vec!["soft degraded"]);
    assert_eq!(stages, vec!["soft", "after"]);
}
