//! Instance handle and the scoped session every operation runs in.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use recdb::{Connections, Database, Storage};

use crate::ontology::PublicSource;
use crate::run_context::RunContext;
use crate::settings::{Settings, Verbosity};
use crate::{Error, Result};

/// One lamindb instance: the default database, attached databases, settings,
/// run context, and an optional public ontology.
pub struct Instance<S: Storage> {
    connections: Arc<Mutex<Connections<S>>>,
    settings: Settings,
    run_context: RunContext,
    public_source: Option<Arc<dyn PublicSource>>,
}

impl<S: Storage> Instance<S> {
    pub fn new(default_storage: S, settings: Settings) -> Self {
        Self {
            connections: Arc::new(Mutex::new(Connections::new(default_storage))),
            settings,
            run_context: RunContext::default(),
            public_source: None,
        }
    }

    pub fn with_public_source(mut self, source: Arc<dyn PublicSource>) -> Self {
        self.public_source = Some(source);
        self
    }

    pub fn attach(&self, name: &str, storage: S) -> Result<()> {
        let mut conns = self.lock()?;
        conns.attach(name, storage)?;
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn run_context(&self) -> &RunContext {
        &self.run_context
    }

    pub fn set_run_context(&mut self, ctx: RunContext) {
        self.run_context = ctx;
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connections<S>>> {
        self.connections
            .lock()
            .map_err(|_| Error::Runtime("connection lock poisoned".into()))
    }

    /// Hold the connections for one top-level operation.
    pub fn session(&self) -> Result<Session<'_, S>> {
        Ok(Session {
            conns: self.lock()?,
            settings: self.settings.clone(),
            run_context: self.run_context.clone(),
            public_source: self.public_source.as_deref(),
        })
    }

    pub fn with_session<T>(&self, f: impl FnOnce(&mut Session<'_, S>) -> Result<T>) -> Result<T> {
        let mut session = self.session()?;
        f(&mut session)
    }
}

pub struct Session<'a, S: Storage> {
    conns: MutexGuard<'a, Connections<S>>,
    pub settings: Settings,
    pub run_context: RunContext,
    public_source: Option<&'a dyn PublicSource>,
}

impl<'a, S: Storage> Session<'a, S> {
    pub fn default_db(&self) -> &Database<S> {
        self.conns.default_db()
    }

    pub fn default_db_mut(&mut self) -> &mut Database<S> {
        self.conns.default_db_mut()
    }

    pub fn using(&self, name: &str) -> Result<&Database<S>> {
        Ok(self.conns.using(name)?)
    }

    pub fn using_mut(&mut self, name: &str) -> Result<&mut Database<S>> {
        Ok(self.conns.using_mut(name)?)
    }

    pub fn public_source(&self) -> Option<&'a dyn PublicSource> {
        self.public_source
    }

    pub fn logs(&self, level: Verbosity) -> bool {
        self.settings.logs(level)
    }

    /// Apply `f` to the settings until the returned guard is dropped.
    pub fn override_settings(&mut self, f: impl FnOnce(&mut Settings)) -> SettingsOverride<'_, 'a, S> {
        let prior = self.settings.clone();
        f(&mut self.settings);
        SettingsOverride { session: self, prior: Some(prior) }
    }
}

/// Restores the session settings on drop.
pub struct SettingsOverride<'s, 'a, S: Storage> {
    session: &'s mut Session<'a, S>,
    prior: Option<Settings>,
}

impl<'s, 'a, S: Storage> Deref for SettingsOverride<'s, 'a, S> {
    type Target = Session<'a, S>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<'s, 'a, S: Storage> DerefMut for SettingsOverride<'s, 'a, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<'s, 'a, S: Storage> Drop for SettingsOverride<'s, 'a, S> {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            self.session.settings = prior;
        }
    }
}
