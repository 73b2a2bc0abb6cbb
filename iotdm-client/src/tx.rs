//! Tx pipeline.
//!
//! Every outbound request runs the same five hooks in order:
//!
//! ```text
//! preprocess -> translate_request -> send -> translate_response -> respond
//! ```
//!
//! A hook returning `false` aborts the remaining hooks and marks the request
//! failed. Failures are logged and returned, never retried here.

use async_trait::async_trait;
use std::fmt;

/// Named pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStage {
    Preprocess,
    TranslateRequest,
    Send,
    TranslateResponse,
    Respond,
}

impl TxStage {
    pub const ORDERED: [TxStage; 5] = [
        TxStage::Preprocess,
        TxStage::TranslateRequest,
        TxStage::Send,
        TxStage::TranslateResponse,
        TxStage::Respond,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStage::Preprocess => "preprocess",
            TxStage::TranslateRequest => "translate_request",
            TxStage::Send => "send",
            TxStage::TranslateResponse => "translate_response",
            TxStage::Respond => "respond",
        }
    }
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hooks driven by [`TxPipeline::run`]. Each returns whether to continue.
#[async_trait]
pub trait TxHooks: Send {
    async fn preprocess(&mut self) -> bool;
    async fn translate_request(&mut self) -> bool;
    async fn send(&mut self) -> bool;
    async fn translate_response(&mut self) -> bool;
    async fn respond(&mut self) -> bool;

    /// Short description used in log lines.
    fn describe(&self) -> String {
        String::from("tx request")
    }
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutcome {
    pub success: bool,
    /// Stages that ran to completion.
    pub completed: Vec<TxStage>,
    pub failed_at: Option<TxStage>,
}

impl TxOutcome {
    pub fn failed_at(stage: TxStage, completed: Vec<TxStage>) -> Self {
        Self {
            success: false,
            completed,
            failed_at: Some(stage),
        }
    }
}

/// Drives hooks through the ordered stages.
pub struct TxPipeline;

impl TxPipeline {
    pub async fn run<H: TxHooks + ?Sized>(hooks: &mut H) -> TxOutcome {
        let mut completed = Vec::with_capacity(TxStage::ORDERED.len());
        for stage in TxStage::ORDERED {
            let ok = match stage {
                TxStage::Preprocess => hooks.preprocess().await,
                TxStage::TranslateRequest => hooks.translate_request().await,
                TxStage::Send => hooks.send().await,
                TxStage::TranslateResponse => hooks.translate_response().await,
                TxStage::Respond => hooks.respond().await,
            };
            if !ok {
                tracing::warn!("{} failed at {}", hooks.describe(), stage);
                return TxOutcome::failed_at(stage, completed);
            }
            tracing::trace!("{}: {} done", hooks.describe(), stage);
            completed.push(stage);
        }
        TxOutcome {
            success: true,
            completed,
            failed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records the hooks that ran and fails at a chosen stage.
    struct Recorder {
        fail_at: Option<TxStage>,
        ran: Vec<TxStage>,
    }

    impl Recorder {
        fn new(fail_at: Option<TxStage>) -> Self {
            Self {
                fail_at,
                ran: Vec::new(),
            }
        }

        fn hit(&mut self, stage: TxStage) -> bool {
            self.ran.push(stage);
            self.fail_at != Some(stage)
        }
    }

    #[async_trait]
    impl TxHooks for Recorder {
        async fn preprocess(&mut self) -> bool {
            self.hit(TxStage::Preprocess)
        }
        async fn translate_request(&mut self) -> bool {
            self.hit(TxStage::TranslateRequest)
        }
        async fn send(&mut self) -> bool {
            self.hit(TxStage::Send)
        }
        async fn translate_response(&mut self) -> bool {
            self.hit(TxStage::TranslateResponse)
        }
        async fn respond(&mut self) -> bool {
            self.hit(TxStage::Respond)
        }
    }

    #[tokio::test]
    async fn test_all_stages_run_in_order() {
        let mut hooks = Recorder::new(None);
        let outcome = TxPipeline::run(&mut hooks).await;
        assert!(outcome.success);
        assert_eq!(hooks.ran, TxStage::ORDERED.to_vec());
        assert_eq!(outcome.completed, TxStage::ORDERED.to_vec());
    }

    #[tokio::test]
    async fn test_send_failure_skips_remaining_hooks() {
        let mut hooks = Recorder::new(Some(TxStage::Send));
        let outcome = TxPipeline::run(&mut hooks).await;

        assert!(!outcome.success);
        assert_eq!(outcome.failed_at, Some(TxStage::Send));
        assert!(!hooks.ran.contains(&TxStage::TranslateResponse));
        assert!(!hooks.ran.contains(&TxStage::Respond));
        assert_eq!(
            outcome.completed,
            vec![TxStage::Preprocess, TxStage::TranslateRequest]
        );
    }

    #[tokio::test]
    async fn test_dyn_hooks() {
        let mut hooks: Box<dyn TxHooks> = Box::new(Recorder::new(Some(TxStage::Preprocess)));
        let outcome = TxPipeline::run(hooks.as_mut()).await;
        assert_eq!(outcome.failed_at, Some(TxStage::Preprocess));
        assert!(outcome.completed.is_empty());
    }
}
