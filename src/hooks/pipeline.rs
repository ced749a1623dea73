//! Ordered, budgeted execution of the registered extractors.

use std::sync::Arc;
use std::time::Duration;

use galleryd_common::{Error, HookFailure, Metadata};
use serde::Serialize;
use tokio::time::Instant;

use super::{HookInput, HookRegistry};

/// Result of one pipeline run. Never an error: failures are data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub metadata: Metadata,
    pub failures: Vec<HookFailure>,
    /// Extractors that never started because the budget ran out
    pub skipped: Vec<String>,
}

#[derive(Clone)]
pub struct HookPipeline {
    registry: Arc<HookRegistry>,
    budget: Duration,
}

impl HookPipeline {
    pub fn new(registry: Arc<HookRegistry>, budget: Duration) -> Self {
        Self { registry, budget }
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Run every extractor in name order over `seed`, later keys winning.
    ///
    /// A failing extractor contributes nothing and is recorded. When the
    /// budget expires the running extractor is recorded as timed out and the
    /// rest are skipped.
    pub async fn run(&self, input: &HookInput, seed: Metadata) -> PipelineOutput {
        let deadline = Instant::now() + self.budget;
        let mut out = PipelineOutput {
            metadata: seed,
            ..Default::default()
        };

        let mut hooks = self.registry.extractors().iter();
        while let Some(hook) = hooks.next() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                out.skipped.push(hook.name().to_string());
                out.skipped.extend(hooks.by_ref().map(|h| h.name().to_string()));
                break;
            }

            match tokio::time::timeout(remaining, hook.extract(input, &out.metadata)).await {
                Ok(Ok(partial)) => {
                    tracing::trace!(hook = hook.name(), keys = partial.len(), "Hook contributed");
                    for (key, value) in partial {
                        out.metadata.insert(key, value);
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(hook = hook.name(), file = %input.file.display(), "Hook failed: {}", e);
                    out.failures.push(HookFailure {
                        hook: hook.name().to_string(),
                        error: failure_message(&e),
                    });
                }
                Err(_) => {
                    tracing::warn!(hook = hook.name(), file = %input.file.display(), "Hook budget exhausted");
                    out.failures.push(HookFailure {
                        hook: hook.name().to_string(),
                        error: "timed out".to_string(),
                    });
                    out.skipped.extend(hooks.by_ref().map(|h| h.name().to_string()));
                    break;
                }
            }
        }

        out
    }
}

fn failure_message(e: &Error) -> String {
    match e {
        Error::HookFailed { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::Extractor;
    use async_trait::async_trait;
    use galleryd_common::Result;
    use serde_json::json;

    struct Fixed(&'static str, Metadata);

    #[async_trait]
    impl Extractor for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn extract(&self, _: &HookInput, _: &Metadata) -> Result<Metadata> {
            Ok(self.1.clone())
        }
    }

    struct Failing(&'static str);

    #[async_trait]
    impl Extractor for Failing {
        fn name(&self) -> &str {
            self.0
        }
        async fn extract(&self, _: &HookInput, _: &Metadata) -> Result<Metadata> {
            Err(Error::hook(self.0, "boom"))
        }
    }

    struct Slow(&'static str);

    #[async_trait]
    impl Extractor for Slow {
        fn name(&self) -> &str {
            self.0
        }
        async fn extract(&self, _: &HookInput, _: &Metadata) -> Result<Metadata> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Metadata::new())
        }
    }

    /// Echoes back the x it saw, to check it ran after earlier hooks.
    struct SeesX(&'static str);

    #[async_trait]
    impl Extractor for SeesX {
        fn name(&self) -> &str {
            self.0
        }
        async fn extract(&self, _: &HookInput, current: &Metadata) -> Result<Metadata> {
            let mut m = Metadata::new();
            m.insert("saw_x".into(), current.get("x").cloned().unwrap_or(json!(null)));
            Ok(m)
        }
    }

    fn map(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn pipeline(hooks: Vec<Arc<dyn Extractor>>, budget_ms: u64) -> HookPipeline {
        let mut registry = HookRegistry::new();
        for hook in hooks {
            registry.register(hook).unwrap();
        }
        HookPipeline::new(Arc::new(registry), Duration::from_millis(budget_ms))
    }

    fn input() -> HookInput {
        HookInput::new("/out/a.png", Metadata::new())
    }

    #[tokio::test]
    async fn test_later_hook_wins() {
        // registered out of order on purpose
        let p = pipeline(
            vec![
                Arc::new(Fixed("hookB", map(&[("x", json!(2))]))),
                Arc::new(Fixed("hookA", map(&[("x", json!(1)), ("y", json!("a"))]))),
            ],
            1000,
        );
        let out = p.run(&input(), Metadata::new()).await;
        assert_eq!(out.metadata, map(&[("x", json!(2)), ("y", json!("a"))]));
        assert!(out.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let p = pipeline(
            vec![
                Arc::new(Fixed("a", map(&[("x", json!(1))]))),
                Arc::new(Failing("b")),
                Arc::new(SeesX("c")),
            ],
            1000,
        );
        let out = p.run(&input(), Metadata::new()).await;
        assert_eq!(out.metadata, map(&[("x", json!(1)), ("saw_x", json!(1))]));
        assert_eq!(
            out.failures,
            vec![HookFailure {
                hook: "b".into(),
                error: "boom".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_seed_is_kept() {
        let p = pipeline(vec![Arc::new(Fixed("a", map(&[("x", json!(1))])))], 1000);
        let out = p.run(&input(), map(&[("rating_note", json!("old"))])).await;
        assert_eq!(out.metadata.get("rating_note"), Some(&json!("old")));
        assert_eq!(out.metadata.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_idempotent_runs() {
        let p = pipeline(
            vec![
                Arc::new(Fixed("a", map(&[("x", json!(1))]))),
                Arc::new(SeesX("b")),
            ],
            1000,
        );
        let first = p.run(&input(), Metadata::new()).await;
        let second = p.run(&input(), Metadata::new()).await;
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_expiry_skips_rest() {
        let p = pipeline(
            vec![
                Arc::new(Fixed("a", map(&[("x", json!(1))]))),
                Arc::new(Slow("b")),
                Arc::new(Fixed("c", map(&[("x", json!(3))]))),
            ],
            500,
        );
        let out = p.run(&input(), Metadata::new()).await;
        assert_eq!(out.metadata, map(&[("x", json!(1))]));
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].hook, "b");
        assert_eq!(out.failures[0].error, "timed out");
        assert_eq!(out.skipped, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let p = pipeline(vec![], 1000);
        let out = p.run(&input(), Metadata::new()).await;
        assert_eq!(out, PipelineOutput::default());
    }
}
