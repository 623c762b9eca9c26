//! Gear lifecycle orchestration.
//!
//! Sequences the stages that run after a push:
//!
//! ```text
//! pre_receive   stop (user)                     | builder: pre-receive
//! post_receive  materialize -> build            | builder: post-receive
//!               -> start(secondary) -> deploy
//!               -> start(primary) -> post_deploy
//! remote_deploy start(secondary) -> deploy -> start(primary) -> post_deploy
//! ```
//!
//! Stages run strictly in order and the first failure aborts the rest of the
//! invocation. Nothing is retried or rolled back; whatever already happened
//! (a state of DEPLOYING, cartridges already started) stays as it is.

use crate::cartridge::{CartridgeControl, ControlOptions};
use crate::errors::Result;
use crate::gear::Gear;
use crate::output::OutputSinks;
use crate::repository::RepositoryGateway;
use crate::state::{LifecycleState, StateStore};

use super::control::{GearControlOptions, GearSupervisor};

pub struct GearOrchestrator<'a> {
    gear: &'a Gear,
    cartridges: &'a dyn CartridgeControl,
    state: &'a dyn StateStore,
    repository: &'a dyn RepositoryGateway,
    supervisor: &'a dyn GearSupervisor,
}

impl<'a> GearOrchestrator<'a> {
    pub fn new(
        gear: &'a Gear,
        cartridges: &'a dyn CartridgeControl,
        state: &'a dyn StateStore,
        repository: &'a dyn RepositoryGateway,
        supervisor: &'a dyn GearSupervisor,
    ) -> Self {
        Self {
            gear,
            cartridges,
            state,
            repository,
            supervisor,
        }
    }

    /// Quiesce the gear before new code is accepted, or hand the stage to the
    /// builder cartridge.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn pre_receive(&self, sinks: &mut OutputSinks) -> Result<String> {
        if let Some(builder) = self.cartridges.builder_cartridge() {
            tracing::info!(builder = %builder.name, "Delegating pre-receive to builder");
            return self
                .cartridges
                .do_control("pre-receive", builder, ControlOptions::default(), sinks)
                .await;
        }

        self.stop_gear(GearControlOptions::user(), sinks).await
    }

    /// Run the default build/deploy pipeline, or hand it to the builder
    /// cartridge. Returns the output of every stage in order.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn post_receive(&self, sinks: &mut OutputSinks) -> Result<String> {
        if let Some(builder) = self.cartridges.builder_cartridge() {
            tracing::info!(builder = %builder.name, "Delegating post-receive to builder");
            return self
                .cartridges
                .do_control("post-receive", builder, ControlOptions::default(), sinks)
                .await;
        }

        let commit = self.repository.deploy()?;
        tracing::info!(commit = %commit, "Source materialized");

        let mut output = self.build(sinks).await?;
        output.push_str(&self.rollout(sinks).await?);
        Ok(output)
    }

    /// Set BUILDING, then run `pre-build` and `build` on the primary cartridge.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn build(&self, sinks: &mut OutputSinks) -> Result<String> {
        self.state.set(LifecycleState::Building)?;
        let primary = self.cartridges.primary_cartridge()?;

        let mut output = self
            .cartridges
            .do_control("pre-build", primary, ControlOptions::stage(), sinks)
            .await?;
        output.push_str(
            &self
                .cartridges
                .do_control("build", primary, ControlOptions::stage(), sinks)
                .await?,
        );
        Ok(output)
    }

    /// Set DEPLOYING, then deploy the web proxy (if any) before the primary so
    /// routing is updated ahead of the backend.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn deploy(&self, sinks: &mut OutputSinks) -> Result<String> {
        self.state.set(LifecycleState::Deploying)?;
        let primary = self.cartridges.primary_cartridge()?;

        let mut output = String::new();
        if let Some(proxy) = self.cartridges.web_proxy() {
            output.push_str(
                &self
                    .cartridges
                    .do_control("deploy", proxy, ControlOptions::stage(), sinks)
                    .await?,
            );
        }
        output.push_str(
            &self
                .cartridges
                .do_control("deploy", primary, ControlOptions::stage(), sinks)
                .await?,
        );
        Ok(output)
    }

    /// Run `post-deploy` on the primary cartridge. Leaves the state untouched.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn post_deploy(&self, sinks: &mut OutputSinks) -> Result<String> {
        let primary = self.cartridges.primary_cartridge()?;
        self.cartridges
            .do_control("post-deploy", primary, ControlOptions::stage(), sinks)
            .await
    }

    /// Roll an already materialized and built artifact out on this gear.
    #[tracing::instrument(skip_all, fields(gear = %self.gear.uuid))]
    pub async fn remote_deploy(&self, sinks: &mut OutputSinks) -> Result<String> {
        self.rollout(sinks).await
    }

    pub async fn start_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        tracing::info!(?options, "Starting gear");
        self.supervisor.start_gear(options, sinks).await
    }

    pub async fn stop_gear(
        &self,
        options: GearControlOptions,
        sinks: &mut OutputSinks,
    ) -> Result<String> {
        tracing::info!(?options, "Stopping gear");
        self.supervisor.stop_gear(options, sinks).await
    }

    /// Secondaries up, deploy, primary up, post-deploy.
    async fn rollout(&self, sinks: &mut OutputSinks) -> Result<String> {
        let mut output = self
            .start_gear(GearControlOptions::secondaries(), sinks)
            .await?;
        output.push_str(&self.deploy(sinks).await?);
        output.push_str(&self.start_gear(GearControlOptions::primary(), sinks).await?);
        output.push_str(&self.post_deploy(sinks).await?);
        Ok(output)
    }
}
