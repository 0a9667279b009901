//! Build pipeline: ordered, named stages that configure one client.
//!
//! The hardened pipeline of the back-channel client runs
//!
//! ```text
//! security-defaults → client-action[i]… → resiliency → handler-action[i]… → verify-hardening
//! ```
//!
//! Client names other than the back-channel one never get the hardening
//! stages; a [`NamedClientPipeline`] only runs its own actions.

use crate::error::ConfigError;
use crate::handler::{ClientSettings, HandlerBuilder};
use crate::hardener;
use crate::layers::ResiliencyLayer;
use crate::name::ClientName;
use crate::options::{ClientConfiguration, OptionsMonitor};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

const VERIFY_HARDENING: &str = "verify-hardening";

/// State threaded through the stages of one build.
#[derive(Debug)]
pub struct BuildContext {
    pub settings: ClientSettings,
    pub handler: HandlerBuilder,
}

impl BuildContext {
    #[must_use]
    pub fn new(client: ClientName) -> Self {
        Self {
            settings: ClientSettings::default(),
            handler: HandlerBuilder::new(client),
        }
    }

    #[must_use]
    pub fn client_name(&self) -> &ClientName {
        self.handler.client_name()
    }
}

type StageFn = Box<dyn FnOnce(&mut BuildContext) -> Result<(), ConfigError> + Send>;

struct Stage {
    name: Cow<'static, str>,
    run: StageFn,
}

/// Ordered list of named build stages.
#[derive(Default)]
#[must_use = "a pipeline does nothing until it is run"]
pub struct BuildPipeline {
    stages: Vec<Stage>,
}

impl BuildPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn stage(
        mut self,
        name: impl Into<Cow<'static, str>>,
        run: impl FnOnce(&mut BuildContext) -> Result<(), ConfigError> + Send + 'static,
    ) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            run: Box::new(run),
        });
        self
    }

    /// Append all stages of `other`, after the ones already present.
    pub fn extend(mut self, other: BuildPipeline) -> Self {
        self.stages.extend(other.stages);
        self
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.name.as_ref())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the first stage's `ConfigError`; later stages do not run.
    pub fn run(self, ctx: &mut BuildContext) -> Result<(), ConfigError> {
        for stage in self.stages {
            tracing::trace!(client = %ctx.client_name(), stage = %stage.name, "running build stage");
            if let Err(err) = (stage.run)(ctx) {
                tracing::warn!(
                    client = %ctx.client_name(),
                    stage = %stage.name,
                    error = %err,
                    "client build stage failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// User stages of a configuration snapshot: client actions, the
    /// resiliency layer (when a policy is set), then handler actions.
    pub fn from_configuration(configuration: &ClientConfiguration) -> Self {
        let mut pipeline = Self::new();

        for (i, action) in configuration.client_actions.iter().enumerate() {
            let action = Arc::clone(action);
            pipeline = pipeline.stage(format!("client-action[{i}]"), move |ctx| {
                action(&mut ctx.settings)
            });
        }

        if let Some(policy) = &configuration.retry_policy {
            let layer = ResiliencyLayer::new(Arc::clone(policy));
            pipeline = pipeline.stage("resiliency", move |ctx| {
                ctx.handler.install_resiliency(layer);
                Ok(())
            });
        }

        for (i, action) in configuration.handler_actions.iter().enumerate() {
            let action = Arc::clone(action);
            pipeline = pipeline.stage(format!("handler-action[{i}]"), move |ctx| {
                action(&mut ctx.handler)
            });
        }

        pipeline
    }

    /// Hardened defaults, the user stages of `configuration`, then the
    /// check that the hardened transport survived them.
    pub fn hardened(configuration: &ClientConfiguration) -> Self {
        Self::new()
            .stage("security-defaults", |ctx| {
                hardener::harden_client(&mut ctx.settings);
                hardener::harden_handler(&mut ctx.handler)
            })
            .extend(Self::from_configuration(configuration))
            .stage(VERIFY_HARDENING, verify_hardening)
    }

    /// Append the hardening check unless it already is the last stage.
    ///
    /// The registry calls this for the back-channel name after folding every
    /// provider's stages, so stages contributed after [`Self::hardened`]
    /// are checked too.
    pub fn ending_with_verification(self) -> Self {
        if self
            .stages
            .last()
            .is_some_and(|stage| stage.name == VERIFY_HARDENING)
        {
            return self;
        }
        self.stage(VERIFY_HARDENING, verify_hardening)
    }
}

fn verify_hardening(ctx: &mut BuildContext) -> Result<(), ConfigError> {
    hardener::verify(&ctx.settings, &ctx.handler)
}

impl fmt::Debug for BuildPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.stage_names()).finish()
    }
}

/// Contributes build stages for the client names it owns.
pub trait PipelineProvider: Send + Sync {
    /// Stages for `client`, or `None` if this provider does not own it.
    fn pipeline_for(&self, client: &ClientName) -> Option<BuildPipeline>;
}

/// Hardened pipeline for [`ClientName::backchannel`].
///
/// The configuration is read from the monitor on every build.
#[derive(Debug, Clone, Default)]
pub struct BackchannelPipeline {
    options: OptionsMonitor<ClientConfiguration>,
}

impl BackchannelPipeline {
    #[must_use]
    pub fn new(options: OptionsMonitor<ClientConfiguration>) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &OptionsMonitor<ClientConfiguration> {
        &self.options
    }
}

impl PipelineProvider for BackchannelPipeline {
    fn pipeline_for(&self, client: &ClientName) -> Option<BuildPipeline> {
        client
            .is_backchannel()
            .then(|| BuildPipeline::hardened(&self.options.current()))
    }
}

/// Plain user pipeline for one exact client name, without hardening.
#[derive(Debug, Clone)]
pub struct NamedClientPipeline {
    client: ClientName,
    options: OptionsMonitor<ClientConfiguration>,
}

impl NamedClientPipeline {
    #[must_use]
    pub fn new(client: impl Into<ClientName>, options: OptionsMonitor<ClientConfiguration>) -> Self {
        Self {
            client: client.into(),
            options,
        }
    }
}

impl PipelineProvider for NamedClientPipeline {
    fn pipeline_for(&self, client: &ClientName) -> Option<BuildPipeline> {
        (*client == self.client).then(|| BuildPipeline::from_configuration(&self.options.current()))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{MAX_RESPONSE_BUFFER_SIZE, REQUEST_TIMEOUT};
    use crate::handler::{DelegatingLayer, HyperTransport, TransportKind};
    use crate::policy::BackoffPolicy;
    use std::sync::Mutex;
    use std::time::Duration;

    fn configuration() -> ClientConfiguration {
        ClientConfiguration::new()
            .with_client_action(|_| Ok(()))
            .with_retry_policy(Arc::new(BackoffPolicy::default()))
            .with_handler_action(|_| Ok(()))
            .with_handler_action(|_| Ok(()))
    }

    #[test]
    fn hardened_stage_order() {
        let pipeline = BuildPipeline::hardened(&configuration());
        assert_eq!(
            pipeline.stage_names().collect::<Vec<_>>(),
            [
                "security-defaults",
                "client-action[0]",
                "resiliency",
                "handler-action[0]",
                "handler-action[1]",
                "verify-hardening",
            ]
        );
    }

    #[test]
    fn verification_is_appended_once() {
        let hardened =
            BuildPipeline::hardened(&ClientConfiguration::new()).ending_with_verification();
        assert_eq!(
            hardened.stage_names().collect::<Vec<_>>(),
            ["security-defaults", "verify-hardening"]
        );

        let extended = BuildPipeline::hardened(&ClientConfiguration::new())
            .extend(BuildPipeline::new().stage("late", |_| Ok(())))
            .ending_with_verification();
        assert_eq!(
            extended.stage_names().collect::<Vec<_>>(),
            ["security-defaults", "verify-hardening", "late", "verify-hardening"]
        );
    }

    #[test]
    fn late_stage_replacing_the_primary_is_caught() {
        let pipeline = BuildPipeline::hardened(&ClientConfiguration::new())
            .extend(BuildPipeline::new().stage("late", |ctx| {
                ctx.handler.set_primary(HyperTransport::default());
                Ok(())
            }))
            .ending_with_verification();

        let mut ctx = BuildContext::new(ClientName::backchannel());
        let err = pipeline.run(&mut ctx).unwrap_err();
        assert!(matches!(err, ConfigError::PrimaryReplaced { .. }));
    }

    #[test]
    fn no_policy_means_no_resiliency_stage() {
        let pipeline = BuildPipeline::from_configuration(&ClientConfiguration::new());
        assert!(pipeline.is_empty());
    }

    #[test]
    fn handler_actions_see_hardened_primary_and_resiliency() {
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let configuration = configuration().with_handler_action(move |handler| {
            let has_resiliency = handler.has_resiliency();
            let transport = handler.hyper_transport_mut()?;
            *sink.lock().unwrap() = Some((
                transport.use_cookies,
                transport.is_hardened(),
                has_resiliency,
            ));
            Ok(())
        });

        let mut ctx = BuildContext::new(ClientName::backchannel());
        BuildPipeline::hardened(&configuration).run(&mut ctx).unwrap();

        assert_eq!(*observed.lock().unwrap(), Some((false, true, true)));
        assert_eq!(ctx.settings.timeout, REQUEST_TIMEOUT);
        assert_eq!(ctx.settings.max_response_buffer_size, MAX_RESPONSE_BUFFER_SIZE);
    }

    #[test]
    fn client_actions_run_after_defaults() {
        let configuration = ClientConfiguration::new().with_client_action(|settings| {
            assert_eq!(settings.timeout, REQUEST_TIMEOUT);
            settings.timeout = Duration::from_secs(5);
            Ok(())
        });

        let mut ctx = BuildContext::new(ClientName::backchannel());
        BuildPipeline::hardened(&configuration).run(&mut ctx).unwrap();
        assert_eq!(ctx.settings.timeout, Duration::from_secs(5));
    }

    #[test]
    fn replacing_primary_fails_the_build() {
        let configuration = ClientConfiguration::new().with_handler_action(|handler| {
            handler.set_primary(HyperTransport::default());
            Ok(())
        });

        let mut ctx = BuildContext::new(ClientName::backchannel());
        let err = BuildPipeline::hardened(&configuration)
            .run(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, ConfigError::PrimaryReplaced { .. }));
    }

    #[test]
    fn layers_added_by_handler_actions_keep_resiliency() {
        let configuration = configuration().with_handler_action(|handler| {
            handler.push_layer(DelegatingLayer::new("audit", |inner| inner));
            Ok(())
        });

        let mut ctx = BuildContext::new(ClientName::backchannel());
        BuildPipeline::hardened(&configuration).run(&mut ctx).unwrap();
        assert!(ctx.handler.has_resiliency());
        assert_eq!(ctx.handler.layer_names().collect::<Vec<_>>(), ["audit"]);
    }

    #[test]
    fn failing_stage_stops_the_pipeline() {
        let ran = Arc::new(Mutex::new(false));
        let ran_in_stage = Arc::clone(&ran);
        let pipeline = BuildPipeline::new()
            .stage("reject", |_| Err(ConfigError::Invalid("rejected".to_owned())))
            .stage("after", move |_| {
                *ran_in_stage.lock().unwrap() = true;
                Ok(())
            });

        let mut ctx = BuildContext::new(ClientName::new("tests.pipeline"));
        assert!(matches!(pipeline.run(&mut ctx), Err(ConfigError::Invalid(_))));
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn backchannel_provider_owns_only_its_name() {
        let provider = BackchannelPipeline::default();
        assert!(provider.pipeline_for(&ClientName::backchannel()).is_some());
        assert!(provider.pipeline_for(&ClientName::new("billing")).is_none());
        let prefixed = format!("{}.extra", ClientName::backchannel());
        assert!(provider.pipeline_for(&ClientName::new(prefixed)).is_none());
    }

    #[test]
    fn backchannel_provider_reads_current_options() {
        let provider = BackchannelPipeline::default();
        let before = provider.pipeline_for(&ClientName::backchannel()).unwrap();
        assert!(!before.stage_names().any(|name| name == "resiliency"));

        provider.options().update(configuration());

        let after = provider.pipeline_for(&ClientName::backchannel()).unwrap();
        assert!(after.stage_names().any(|name| name == "resiliency"));
    }

    #[test]
    fn named_pipeline_is_not_hardened() {
        let provider = NamedClientPipeline::new("billing", OptionsMonitor::default());
        let mut ctx = BuildContext::new(ClientName::new("billing"));
        provider
            .pipeline_for(&ClientName::new("billing"))
            .unwrap()
            .run(&mut ctx)
            .unwrap();

        let transport = ctx.handler.hyper_transport().unwrap();
        assert!(transport.use_cookies);
        assert!(!transport.is_hardened());
        assert_eq!(ctx.handler.primary_kind(), TransportKind::Hyper);
        assert_eq!(ctx.settings.timeout, crate::config::DEFAULT_REQUEST_TIMEOUT);
    }
}
