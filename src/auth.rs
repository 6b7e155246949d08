//! Credential gating for the generation service.
//!
//! The gate tracks whether a usable API key is selected and owns the prompt
//! flow that obtains one. The key-selection provider is injected so tests
//! can exercise the gate with fakes instead of ambient global state.

use std::io::{BufRead, Write};

use crate::veo::GEMINI_API_KEY_ENV;

/// Errors surfaced by a credential provider.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential provider failed: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tri-state credential knowledge.
///
/// `Unknown` exists only before the first check; a check always resolves to
/// `Absent` or `Present` and the state never silently reverts to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Unknown,
    Absent,
    Present,
}

/// External authorization collaborator: reports whether a key is selected
/// and opens a selection flow. No stronger contract is guaranteed; in
/// particular the selection flow gives no signal distinguishing "selected"
/// from "dismissed".
pub trait CredentialProvider {
    fn has_selected_key(&self) -> Result<bool, AuthError>;
    fn open_key_selector(&mut self) -> Result<(), AuthError>;
}

type KeySelectedCallback = Box<dyn FnMut() + Send>;

/// Tracks credential state and drives the prompt flow.
///
/// Check and prompt both take `&mut self`, so the two mutations of the
/// shared state are serialized by construction.
pub struct CredentialGate<P: CredentialProvider> {
    provider: P,
    state: KeyState,
    force_prompt: bool,
    on_key_selected: Option<KeySelectedCallback>,
}

impl<P: CredentialProvider> CredentialGate<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            state: KeyState::Unknown,
            force_prompt: false,
            on_key_selected: None,
        }
    }

    /// Register a callback fired once per check/prompt that resolves to
    /// `Present`.
    pub fn on_key_selected(&mut self, callback: KeySelectedCallback) {
        self.on_key_selected = Some(callback);
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    /// Query the provider for the current key state.
    ///
    /// Fails closed: a provider error resolves to `Absent`, never leaving
    /// `Unknown` visible to the caller.
    pub fn check_key(&mut self) -> KeyState {
        match self.provider.has_selected_key() {
            Ok(true) => {
                self.state = KeyState::Present;
                self.notify();
            }
            Ok(false) => {
                self.state = KeyState::Absent;
            }
            Err(e) => {
                log::warn!("Credential check failed, treating key as absent: {}", e);
                self.state = KeyState::Absent;
            }
        }
        self.state
    }

    /// Run the provider's key selection flow.
    ///
    /// The provider gives no confirmation signal, so a flow that returns
    /// without error is assumed to have selected a key: state becomes
    /// `Present` and the callback fires. A provider error leaves the state
    /// (and the force flag) unchanged.
    pub fn prompt_for_key(&mut self) -> KeyState {
        match self.provider.open_key_selector() {
            Ok(()) => {
                self.state = KeyState::Present;
                self.force_prompt = false;
                self.notify();
            }
            Err(e) => {
                log::error!("Error opening key selector: {}", e);
            }
        }
        self.state
    }

    /// Signal from a downstream authorization failure: the prompt must be
    /// shown again even though the cached state still reads `Present`.
    pub fn force_reprompt(&mut self) {
        self.force_prompt = true;
    }

    /// Whether the selection prompt should be shown.
    pub fn prompt_visible(&self) -> bool {
        self.state != KeyState::Present || self.force_prompt
    }

    fn notify(&mut self) {
        if let Some(callback) = &mut self.on_key_selected {
            callback();
        }
    }
}

/// Production provider: the key lives in the `GEMINI_API_KEY` environment
/// variable, and the "selector" is an interactive stdin prompt.
pub struct EnvKeyProvider {
    env_var: &'static str,
}

impl EnvKeyProvider {
    pub fn new() -> Self {
        Self {
            env_var: GEMINI_API_KEY_ENV,
        }
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for EnvKeyProvider {
    fn has_selected_key(&self) -> Result<bool, AuthError> {
        Ok(std::env::var(self.env_var)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false))
    }

    fn open_key_selector(&mut self) -> Result<(), AuthError> {
        println!("A Gemini API key with billing enabled is required for Veo video models.");
        println!("Get one at: https://aistudio.google.com/");
        print!("Paste your API key: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        let stdin = std::io::stdin();
        stdin.lock().read_line(&mut line)?;

        let key = line.trim();
        if key.is_empty() {
            // The flow still "returned" - the optimistic contract is the
            // caller's, but an empty paste is worth flagging here.
            log::warn!("Empty API key entered; downstream requests will fail");
            return Ok(());
        }

        std::env::set_var(self.env_var, key);
        Ok(())
    }
}
