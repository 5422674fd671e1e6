//! Middleware pipeline.
//!
//! A [`Middleware`] stage intercepts dispatches travelling in one
//! [`Direction`]. Stages run in insertion order; each receives the current
//! argument tuple and either passes a (possibly rewritten) tuple on or stops
//! the dispatch. A stage that returns an error or panics also stops it, and
//! the caller decides whether that failure is surfaced or logged.

use std::fmt;
use std::sync::Arc;

use beacon_core::{Args, PeerId};
use thiserror::Error;
use tracing::trace;

use crate::isolate::isolate;

/// Which way a dispatch is travelling relative to the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Arriving from the transport, before local callbacks run.
    Inbound,
    /// Leaving through the transport, after a local `fire`.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// What a stage can see about the dispatch besides its arguments.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareContext<'a> {
    /// Route of the signal.
    pub route: &'a str,
    /// Direction of travel.
    pub direction: Direction,
    /// Sending peer (inbound on a server) or the single target peer
    /// (`fire_for_player`). `None` otherwise.
    pub peer: Option<&'a PeerId>,
}

/// Decision of a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Hand these arguments to the next stage.
    Continue(Args),
    /// Drop the dispatch.
    Stop,
}

/// Failure reported by a stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct MiddlewareError {
    message: String,
}

impl MiddlewareError {
    /// Create an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An interceptor for one direction of traffic.
pub trait Middleware: Send + Sync {
    /// Stage name, reported in vetoes and failures.
    fn name(&self) -> &str;

    /// Direction this stage applies to.
    fn direction(&self) -> Direction;

    /// Inspect or rewrite `args`.
    fn process(&self, ctx: &MiddlewareContext<'_>, args: Args) -> Result<Verdict, MiddlewareError>;
}

/// A [`Middleware`] built from a closure.
pub struct FnMiddleware<F> {
    name: String,
    direction: Direction,
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(&MiddlewareContext<'_>, Args) -> Result<Verdict, MiddlewareError> + Send + Sync,
{
    /// Inbound stage.
    pub fn inbound(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Inbound,
            f,
        }
    }

    /// Outbound stage.
    pub fn outbound(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Outbound,
            f,
        }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&MiddlewareContext<'_>, Args) -> Result<Verdict, MiddlewareError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn process(&self, ctx: &MiddlewareContext<'_>, args: Args) -> Result<Verdict, MiddlewareError> {
        (self.f)(ctx, args)
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Result of running a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Every stage passed; deliver these arguments.
    Continue(Args),
    /// A stage returned [`Verdict::Stop`].
    Vetoed {
        /// Name of the vetoing stage.
        stage: String,
    },
    /// A stage returned an error or panicked.
    Failed {
        /// Name of the failing stage.
        stage: String,
        /// Error or panic message.
        message: String,
    },
}

/// Ordered chain of stages. Cloning copies the chain, not the stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn add(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    /// Number of stages for `direction`.
    #[must_use]
    pub fn len(&self, direction: Direction) -> usize {
        self.stages
            .iter()
            .filter(|s| s.direction() == direction)
            .count()
    }

    /// Whether the pipeline has no stages at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run the stages matching `ctx.direction` over `args`.
    pub fn run(&self, ctx: &MiddlewareContext<'_>, args: Args) -> PipelineOutcome {
        let mut args = args;
        for stage in self.stages.iter().filter(|s| s.direction() == ctx.direction) {
            let input = args;
            match isolate(|| stage.process(ctx, input)) {
                Ok(Ok(Verdict::Continue(next))) => args = next,
                Ok(Ok(Verdict::Stop)) => {
                    trace!(
                        route = ctx.route,
                        stage = stage.name(),
                        direction = %ctx.direction,
                        "vetoed"
                    );
                    return PipelineOutcome::Vetoed {
                        stage: stage.name().to_string(),
                    };
                }
                Ok(Err(e)) => {
                    return PipelineOutcome::Failed {
                        stage: stage.name().to_string(),
                        message: e.to_string(),
                    };
                }
                Err(panic) => {
                    return PipelineOutcome::Failed {
                        stage: stage.name().to_string(),
                        message: format!("panicked: {panic}"),
                    };
                }
            }
        }
        PipelineOutcome::Continue(args)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .stages
            .iter()
            .map(|s| format!("{}:{}", s.direction(), s.name()))
            .collect();
        f.debug_struct("Pipeline").field("stages", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use beacon_core::args;
    use serde_json::json;

    fn ctx(direction: Direction) -> MiddlewareContext<'static> {
        MiddlewareContext {
            route: "/Damage",
            direction,
            peer: None,
        }
    }

    fn block_first(value: &'static str) -> Arc<dyn Middleware> {
        Arc::new(FnMiddleware::inbound(
            "block",
            move |_ctx: &MiddlewareContext<'_>, args: Args| {
                if args.first_str() == Some(value) {
                    Ok(Verdict::Stop)
                } else {
                    Ok(Verdict::Continue(args))
                }
            },
        ))
    }

    #[test]
    fn empty_pipeline_passes_through() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        assert_eq!(
            pipeline.run(&ctx(Direction::Inbound), args!["ok", 1]),
            PipelineOutcome::Continue(args!["ok", 1])
        );
    }

    #[test]
    fn stages_run_in_insertion_order() {
        let mut pipeline = Pipeline::new();
        for tag in ["a", "b", "c"] {
            pipeline.add(Arc::new(FnMiddleware::outbound(
                tag,
                move |_ctx: &MiddlewareContext<'_>, mut args: Args| {
                    args.push(tag);
                    Ok(Verdict::Continue(args))
                },
            )));
        }
        assert_eq!(
            pipeline.run(&ctx(Direction::Outbound), args![]),
            PipelineOutcome::Continue(args!["a", "b", "c"])
        );
    }

    #[test]
    fn other_direction_is_skipped() {
        let mut pipeline = Pipeline::new();
        pipeline.add(block_first("blocked"));
        assert_eq!(pipeline.len(Direction::Inbound), 1);
        assert_eq!(pipeline.len(Direction::Outbound), 0);
        assert_eq!(
            pipeline.run(&ctx(Direction::Outbound), args!["blocked"]),
            PipelineOutcome::Continue(args!["blocked"])
        );
    }

    #[test]
    fn stop_short_circuits_later_stages() {
        let mut pipeline = Pipeline::new();
        pipeline.add(block_first("blocked"));
        pipeline.add(Arc::new(FnMiddleware::inbound(
            "after",
            |_ctx: &MiddlewareContext<'_>, _args: Args| -> Result<Verdict, MiddlewareError> {
                panic!("must not run")
            },
        )));

        assert_eq!(
            pipeline.run(&ctx(Direction::Inbound), args!["blocked", 1]),
            PipelineOutcome::Vetoed {
                stage: "block".into()
            }
        );
    }

    #[test]
    fn stage_can_rewrite_arguments() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Arc::new(FnMiddleware::inbound(
            "double",
            |_ctx: &MiddlewareContext<'_>, args: Args| {
                let doubled = args
                    .iter()
                    .map(|v| json!(v.as_i64().unwrap_or_default() * 2))
                    .collect();
                Ok(Verdict::Continue(doubled))
            },
        )));
        assert_eq!(
            pipeline.run(&ctx(Direction::Inbound), args![1, 2]),
            PipelineOutcome::Continue(args![2, 4])
        );
    }

    #[test]
    fn error_becomes_failure() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Arc::new(FnMiddleware::outbound(
            "auth",
            |_ctx: &MiddlewareContext<'_>, _args: Args| Err(MiddlewareError::new("not allowed")),
        )));
        assert_matches!(
            pipeline.run(&ctx(Direction::Outbound), args![]),
            PipelineOutcome::Failed { stage, message } if stage == "auth" && message == "not allowed"
        );
    }

    #[test]
    fn panic_becomes_failure() {
        let mut pipeline = Pipeline::new();
        pipeline.add(Arc::new(FnMiddleware::inbound(
            "explode",
            |_ctx: &MiddlewareContext<'_>, _args: Args| -> Result<Verdict, MiddlewareError> {
                panic!("kaboom")
            },
        )));
        assert_matches!(
            pipeline.run(&ctx(Direction::Inbound), args![]),
            PipelineOutcome::Failed { stage, message } if stage == "explode" && message.contains("kaboom")
        );
    }

    #[test]
    fn context_exposes_peer() {
        let peer = PeerId::from("p1");
        let mut pipeline = Pipeline::new();
        pipeline.add(Arc::new(FnMiddleware::inbound(
            "tag-sender",
            |ctx: &MiddlewareContext<'_>, mut args: Args| {
                args.push(ctx.peer.map(PeerId::to_string));
                Ok(Verdict::Continue(args))
            },
        )));
        let ctx = MiddlewareContext {
            route: "/Chat",
            direction: Direction::Inbound,
            peer: Some(&peer),
        };
        assert_eq!(
            pipeline.run(&ctx, args![]),
            PipelineOutcome::Continue(args!["p1"])
        );
    }

    #[test]
    fn debug_lists_stages() {
        let mut pipeline = Pipeline::new();
        pipeline.add(block_first("x"));
        assert_eq!(format!("{pipeline:?}"), r#"Pipeline { stages: ["inbound:block"] }"#);
    }
}
