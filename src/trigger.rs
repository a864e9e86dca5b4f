//! Trigger release once every unit is armed
//!
//! Exactly one release action is chosen per run from mutually exclusive
//! options. The action fires at most once, no matter how many cycles see
//! the all-armed condition or how many threads evaluate it.

use crate::backend::{Connector, Key, RemoteDevice, Scope, SignalGenerator};
use crate::config::TriggerOptions;
use crate::error::{Result, StreamError};
use crate::types::RemotePort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Validated choice of trigger action
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TriggerSelection {
    /// Units trigger themselves
    #[default]
    None,
    /// Trigger an external signal generator
    SignalGenerator(String),
    /// First unit sends this command on its comm site C
    InterUnit(String),
    /// First unit's `SIG_SRC_TRG_0` is switched to this source
    MasterConfig(String),
}

impl TriggerSelection {
    /// Pick the action; supplying more than one option is an error
    pub fn from_options(options: &TriggerOptions) -> Result<Self> {
        let mut chosen = Vec::new();
        if let Some(name) = &options.sig_gen {
            chosen.push(TriggerSelection::SignalGenerator(name.clone()));
        }
        if let Some(command) = &options.wrtd_txi {
            chosen.push(TriggerSelection::InterUnit(command.clone()));
        }
        if let Some(source) = &options.mtrg {
            chosen.push(TriggerSelection::MasterConfig(source.clone()));
        }

        match chosen.len() {
            0 => Ok(TriggerSelection::None),
            1 => Ok(chosen.remove(0)),
            _ => Err(StreamError::Config(format!(
                "duplicate trigger action: {}",
                chosen
                    .iter()
                    .map(TriggerSelection::label)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TriggerSelection::None => "none",
            TriggerSelection::SignalGenerator(_) => "sig_gen",
            TriggerSelection::InterUnit(_) => "wrtd_txi",
            TriggerSelection::MasterConfig(_) => "mtrg",
        }
    }

    /// True if configure must route the inter-unit trigger to d1
    pub fn is_inter_unit(&self) -> bool {
        matches!(self, TriggerSelection::InterUnit(_))
    }
}

enum TriggerAction {
    None,
    SignalGenerator(Arc<dyn SignalGenerator>),
    InterUnit {
        device: Arc<dyn RemoteDevice>,
        command: String,
    },
    MasterConfig {
        device: Arc<dyn RemoteDevice>,
        source: String,
    },
}

/// Result of one evaluation
#[derive(Debug)]
pub struct TriggerOutcome {
    /// True only on the evaluation that fired
    pub fired: bool,
    /// Status line for the display
    pub message: String,
    /// Set when firing failed; the run should shut down
    pub error: Option<StreamError>,
}

/// One-shot trigger release
pub struct TriggerReleaser {
    action: TriggerAction,
    triggered: AtomicBool,
    message: Mutex<String>,
}

impl TriggerReleaser {
    /// Build the releaser; `top` is the first unit of the run
    ///
    /// A master-config trigger forces the first unit's trigger source to
    /// `NONE` here so it cannot fire before every unit is armed.
    pub fn new(
        selection: &TriggerSelection,
        top: Option<Arc<dyn RemoteDevice>>,
        connector: &dyn Connector,
    ) -> Result<Self> {
        let need_top = || {
            top.clone()
                .ok_or_else(|| StreamError::Config("trigger needs at least one unit".to_string()))
        };

        let (action, message) = match selection {
            TriggerSelection::None => (TriggerAction::None, String::new()),
            TriggerSelection::SignalGenerator(name) => (
                TriggerAction::SignalGenerator(connector.signal_generator(name)),
                format!("Waiting to trigger {}", name),
            ),
            TriggerSelection::InterUnit(command) => (
                TriggerAction::InterUnit {
                    device: need_top()?,
                    command: command.clone(),
                },
                "Waiting to trigger wrtd_txi".to_string(),
            ),
            TriggerSelection::MasterConfig(source) => {
                let device = need_top()?;
                tracing::warn!("mtrg {} assume free-run, set source NONE", source);
                device.set(&Key::SigSrcTrg0, "NONE")?;
                (
                    TriggerAction::MasterConfig {
                        device,
                        source: source.clone(),
                    },
                    format!("Waiting to trigger mtrg {}", source),
                )
            }
        };

        Ok(Self {
            action,
            triggered: AtomicBool::new(false),
            message: Mutex::new(message),
        })
    }

    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn message(&self) -> String {
        self.message.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn set_message(&self, message: String) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = message;
        }
    }

    /// Fire the action if every unit is armed and it has not fired yet
    pub fn evaluate(&self, all_armed: bool) -> TriggerOutcome {
        let idle = |releaser: &Self| TriggerOutcome {
            fired: false,
            message: releaser.message(),
            error: None,
        };

        if matches!(self.action, TriggerAction::None) || !all_armed {
            return idle(self);
        }
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return idle(self);
        }

        let (message, error) = match &self.action {
            TriggerAction::None => (String::new(), None),
            TriggerAction::SignalGenerator(generator) => match generator.trigger() {
                Ok(()) => (format!("Triggered {}", generator.name()), None),
                Err(e) => (format!("Could not trigger {}", generator.name()), Some(e)),
            },
            TriggerAction::InterUnit { device, command } => {
                match device.send(Scope::Comm(RemotePort::C), command) {
                    Ok(_) => ("Triggered wrtd_txi".to_string(), None),
                    Err(e) => ("Could not trigger wrtd_txi".to_string(), Some(e)),
                }
            }
            TriggerAction::MasterConfig { device, source } => {
                match device.set(&Key::SigSrcTrg0, source) {
                    Ok(()) => (format!("Trigger mtrg {}", source), None),
                    Err(e) => (format!("Could not trigger mtrg {}", source), Some(e)),
                }
            }
        };

        match &error {
            None => tracing::info!("{}", message),
            Some(e) => tracing::error!("{}: {}", message, e),
        }
        self.set_message(message.clone());
        TriggerOutcome {
            fired: error.is_none(),
            message,
            error: error.map(|e| StreamError::Trigger(e.to_string())),
        }
    }
}
