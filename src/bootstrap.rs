//! Ordered startup that brings local storage online before anything that
//! needs it may run.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
  Idle,
  ValidatingConfig,
  InitDb,
  InitStore,
  SchedulingSync,
  CleaningFiles,
  Ready,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapState {
  pub phase: Phase,
  pub error: Option<String>,
}

impl BootstrapState {
  fn at(phase: Phase) -> Self {
    Self { phase, error: None }
  }

  pub fn readiness(&self) -> Readiness {
    match self.phase {
      Phase::Ready => Readiness::Ready,
      Phase::Failed => Readiness::Failed(
        self
          .error
          .clone()
          .unwrap_or_else(|| "Bootstrap failed".to_string()),
      ),
      _ => Readiness::NotReady,
    }
  }
}

/// What dependents are allowed to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "kebab-case")]
pub enum Readiness {
  /// Still starting; offline features stay suspended.
  NotReady,
  /// Startup failed; offer a retry.
  Failed(String),
  Ready,
}

/// The work behind each phase.
#[async_trait]
pub trait BootstrapSteps: Send + Sync {
  async fn validate_config(&self) -> Result<()>;
  async fn init_db(&self) -> Result<()>;
  async fn init_store(&self) -> Result<()>;
  async fn schedule_sync(&self) -> Result<()>;
  /// Best effort. Returns how many files were removed.
  async fn clean_files(&self) -> Result<usize>;
}

pub struct Bootstrap<P: BootstrapSteps + ?Sized> {
  steps: Arc<P>,
  state: watch::Sender<BootstrapState>,
  /// Held for the length of a run
  running: Mutex<()>,
}

impl<P: BootstrapSteps + ?Sized> Bootstrap<P> {
  pub fn new(steps: Arc<P>) -> Self {
    let (state, _) = watch::channel(BootstrapState::at(Phase::Idle));
    Self {
      steps,
      state,
      running: Mutex::new(()),
    }
  }

  pub fn state(&self) -> BootstrapState {
    self.state.borrow().clone()
  }

  pub fn readiness(&self) -> Readiness {
    self.state.borrow().readiness()
  }

  pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
    self.state.subscribe()
  }

  /// Run every phase once. Only valid from `Idle`; after a failure use
  /// [`Bootstrap::retry`].
  pub async fn run(&self) -> Result<BootstrapState> {
    let _running = self
      .running
      .try_lock()
      .map_err(|_| eyre!("Bootstrap is already running"))?;

    let phase = self.state.borrow().phase;
    if phase != Phase::Idle {
      return Err(eyre!("Bootstrap already ran (phase {:?})", phase));
    }
    Ok(self.execute().await)
  }

  /// Reset to `Idle` and run every phase again from the start.
  pub async fn retry(&self) -> Result<BootstrapState> {
    let _running = self
      .running
      .try_lock()
      .map_err(|_| eyre!("Bootstrap is already running"))?;

    tracing::info!("retrying bootstrap");
    self.state.send_replace(BootstrapState::at(Phase::Idle));
    Ok(self.execute().await)
  }

  async fn execute(&self) -> BootstrapState {
    for phase in [
      Phase::ValidatingConfig,
      Phase::InitDb,
      Phase::InitStore,
      Phase::SchedulingSync,
    ] {
      self.enter(phase);
      let result = match phase {
        Phase::ValidatingConfig => self.steps.validate_config().await,
        Phase::InitDb => self.steps.init_db().await,
        Phase::InitStore => self.steps.init_store().await,
        _ => self.steps.schedule_sync().await,
      };

      if let Err(err) = result {
        let message = format!("{err:#}");
        tracing::error!(?phase, error = %message, "bootstrap failed");
        let failed = BootstrapState {
          phase: Phase::Failed,
          error: Some(message),
        };
        self.state.send_replace(failed.clone());
        return failed;
      }
    }

    self.enter(Phase::CleaningFiles);
    match self.steps.clean_files().await {
      Ok(removed) => tracing::info!(removed, "cleaned stale offline files"),
      Err(err) => tracing::warn!(error = %format!("{err:#}"), "offline file cleanup failed"),
    }

    let ready = BootstrapState::at(Phase::Ready);
    self.state.send_replace(ready.clone());
    tracing::info!("bootstrap complete");
    ready
  }

  fn enter(&self, phase: Phase) {
    tracing::debug!(?phase, "bootstrap phase");
    self.state.send_replace(BootstrapState::at(phase));
  }
}
