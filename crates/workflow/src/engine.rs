//! Stage engine.
//!
//! A workflow runs its stages in three phases: every `setup` in order (a
//! setup may return child stages, inserted right after their parent), every
//! `execute` in order until the first error, then every `teardown` in
//! reverse order, but only for stages whose `setup` succeeded. A stage
//! that fails its own `setup` must release whatever it had acquired before
//! returning; it gets no teardown call.
//!
//! The first error from any hook is the workflow's result; teardown errors
//! after an earlier failure are logged and do not replace it.

use crate::context::RunContext;
use pgharbor_core::Result;
use tracing::{debug, warn};

/// One pipeline stage.
pub trait Stage: Send {
    /// Stage name, used in logs and failure reports.
    fn name(&self) -> &str;

    /// Acquire resources. Returned stages are inserted after this one and
    /// run their own setup in turn.
    fn setup(&mut self, _ctx: &mut RunContext) -> Result<Vec<Box<dyn Stage>>> {
        Ok(Vec::new())
    }

    /// Do the work.
    fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    /// Release resources. Runs once per successful setup, in reverse stage
    /// order, regardless of the execute outcome.
    fn teardown(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }
}

/// An ordered list of stages sharing a run context.
#[derive(Default)]
pub struct Workflow {
    stages: Vec<Box<dyn Stage>>,
}

impl Workflow {
    /// An empty workflow.
    pub fn new() -> Self {
        Workflow { stages: Vec::new() }
    }

    /// Build from a stage list.
    pub fn with_stages(stages: Vec<Box<dyn Stage>>) -> Self {
        Workflow { stages }
    }

    /// Append a stage.
    pub fn push(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Number of stages currently in the workflow.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the workflow has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the workflow to completion against a context.
    pub fn run(&mut self, ctx: &mut RunContext) -> Result<()> {
        let mut first_error = None;

        // Setup phase. Children returned by a setup are spliced in right
        // after their parent so their setups run before later siblings.
        let mut setup_count = 0;
        let mut i = 0;
        while i < self.stages.len() {
            debug!(target: "pgharbor::workflow", stage = self.stages[i].name(), "setup");
            match self.stages[i].setup(ctx) {
                Ok(children) => {
                    setup_count = i + 1;
                    for (offset, child) in children.into_iter().enumerate() {
                        self.stages.insert(i + 1 + offset, child);
                    }
                }
                Err(e) => {
                    warn!(
                        target: "pgharbor::workflow",
                        stage = self.stages[i].name(),
                        error = %e,
                        "setup failed"
                    );
                    first_error = Some(e);
                    break;
                }
            }
            i += 1;
        }

        // Execute phase, skipped entirely after a setup failure.
        if first_error.is_none() {
            for stage in &mut self.stages[..setup_count] {
                debug!(target: "pgharbor::workflow", stage = stage.name(), "execute");
                if let Err(e) = stage.execute(ctx) {
                    warn!(
                        target: "pgharbor::workflow",
                        stage = stage.name(),
                        error = %e,
                        "execute failed"
                    );
                    first_error = Some(e);
                    break;
                }
            }
        }

        // Teardown phase: reverse order, one call per successful setup.
        for stage in self.stages[..setup_count].iter_mut().rev() {
            debug!(target: "pgharbor::workflow", stage = stage.name(), "teardown");
            if let Err(e) = stage.teardown(ctx) {
                warn!(
                    target: "pgharbor::workflow",
                    stage = stage.name(),
                    error = %e,
                    "teardown failed"
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgharbor_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records hook invocations into the context under its name.
    struct Probe {
        name: String,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
        fail_setup: bool,
        fail_execute: bool,
        teardowns: Arc<AtomicUsize>,
    }

    impl Probe {
        fn new(name: &str, log: &Arc<parking_lot::Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Probe {
                name: name.to_string(),
                log: log.clone(),
                fail_setup: false,
                fail_execute: false,
                teardowns: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn mark(&self, hook: &str) {
            self.log.lock().push(format!("{}:{}", self.name, hook));
        }
    }

    impl Stage for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn setup(&mut self, _ctx: &mut RunContext) -> Result<Vec<Box<dyn Stage>>> {
            self.mark("setup");
            if self.fail_setup {
                return Err(Error::transport("setup failed"));
            }
            Ok(Vec::new())
        }

        fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
            self.mark("execute");
            if self.fail_execute {
                return Err(Error::corruption("execute failed"));
            }
            Ok(())
        }

        fn teardown(&mut self, _ctx: &mut RunContext) -> Result<()> {
            self.mark("teardown");
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn log() -> Arc<parking_lot::Mutex<Vec<String>>> {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[test]
    fn test_happy_path_ordering() {
        let log = log();
        let mut workflow = Workflow::new();
        workflow.push(Probe::new("a", &log));
        workflow.push(Probe::new("b", &log));

        let mut ctx = RunContext::new();
        workflow.run(&mut ctx).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "a:setup",
                "b:setup",
                "a:execute",
                "b:execute",
                "b:teardown",
                "a:teardown"
            ]
        );
    }

    #[test]
    fn test_execute_failure_skips_rest_but_tears_down_all() {
        let log = log();
        let mut workflow = Workflow::new();
        workflow.push(Probe::new("a", &log));
        let mut failing = Probe::new("b", &log);
        failing.fail_execute = true;
        workflow.push(failing);
        workflow.push(Probe::new("c", &log));

        let mut ctx = RunContext::new();
        let err = workflow.run(&mut ctx).unwrap_err();
        assert_eq!(err.code(), "corruption");

        assert_eq!(
            *log.lock(),
            vec![
                "a:setup",
                "b:setup",
                "c:setup",
                "a:execute",
                "b:execute",
                "c:teardown",
                "b:teardown",
                "a:teardown"
            ]
        );
    }

    #[test]
    fn test_setup_failure_gets_no_teardown_for_failing_stage() {
        let log = log();
        let mut workflow = Workflow::new();
        workflow.push(Probe::new("a", &log));
        let mut failing = Probe::new("b", &log);
        failing.fail_setup = true;
        workflow.push(failing);
        workflow.push(Probe::new("c", &log));

        let mut ctx = RunContext::new();
        let err = workflow.run(&mut ctx).unwrap_err();
        assert_eq!(err.code(), "transport_error");

        // c never set up, b's setup failed: only a is torn down. No
        // executes at all.
        assert_eq!(*log.lock(), vec!["a:setup", "b:setup", "a:teardown"]);
    }

    #[test]
    fn test_teardown_runs_once_per_successful_setup() {
        let log = log();
        let mut workflow = Workflow::new();
        let stage = Probe::new("a", &log);
        let teardowns = stage.teardowns.clone();
        workflow.push(stage);

        let mut ctx = RunContext::new();
        workflow.run(&mut ctx).unwrap();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    /// Parent stage that spawns a child during setup.
    struct Parent {
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl Stage for Parent {
        fn name(&self) -> &str {
            "parent"
        }

        fn setup(&mut self, _ctx: &mut RunContext) -> Result<Vec<Box<dyn Stage>>> {
            self.log.lock().push("parent:setup".to_string());
            Ok(vec![Probe::new("child", &self.log)])
        }

        fn execute(&mut self, _ctx: &mut RunContext) -> Result<()> {
            self.log.lock().push("parent:execute".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_dynamic_children_run_after_parent() {
        let log = log();
        let mut workflow = Workflow::new();
        workflow.push(Box::new(Parent { log: log.clone() }));
        workflow.push(Probe::new("tail", &log));

        let mut ctx = RunContext::new();
        workflow.run(&mut ctx).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "parent:setup",
                "child:setup",
                "tail:setup",
                "parent:execute",
                "child:execute",
                "tail:execute",
                "tail:teardown",
                "child:teardown",
            ]
        );
    }
}
