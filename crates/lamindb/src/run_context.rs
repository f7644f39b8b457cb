//! Active run context and input tracking.

use recdb::{Link, Model, RowId, Storage};
use tracing::info;

use crate::host::Host;
use crate::instance::Session;
use crate::record::Record;
use crate::schema::{Run, Transform, User};
use crate::settings::Verbosity;
use crate::Result;

/// Where new records come from. Every field may be unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunContext {
    pub user: Option<RowId>,
    pub transform: Option<RowId>,
    pub run: Option<RowId>,
}

impl RunContext {
    /// Save `user` and `transform` on the default database if needed and
    /// start a new run of the transform.
    pub fn track<S: Storage>(session: &mut Session<'_, S>, user: &mut User, transform: &mut Transform) -> Result<RunContext> {
        let db = session.default_db_mut();

        if !user.is_persisted() {
            match db.one_or_none::<User>("handle", &serde_json::json!(user.handle))? {
                Some(existing) => *user = existing,
                None => {
                    db.insert(user)?;
                }
            }
        }
        if !transform.is_persisted() {
            transform.created_by_id = user.id;
            db.insert(transform)?;
        }

        let transform_id = transform.id.unwrap_or_default();
        let mut run = Run::new(transform_id, user.id);
        let run_id = db.insert(&mut run)?;

        if session.logs(Verbosity::Info) {
            info!(transform = %transform.display(), run = run_id, "tracking run");
        }

        Ok(RunContext { user: user.id, transform: transform.id, run: Some(run_id) })
    }

    pub fn is_active(&self) -> bool {
        self.run.is_some()
    }

    /// Stamp provenance on a record about to be created.
    pub fn stamp<R: Record>(&self, record: &mut R) {
        record.set_foreign_key("created_by", self.user);
        record.set_foreign_key("run", self.run);
        record.set_foreign_key("transform", self.transform);
    }
}

/// Record `host` as an input of `run`. Returns `false` when already recorded.
pub fn track_input<H: Host, S: Storage>(session: &mut Session<'_, S>, run: RowId, host: &H) -> Result<bool> {
    let host = host.host_ref()?;
    Ok(session
        .default_db_mut()
        .link(Link::new(host.kind.input_relation(), run, host.id))?)
}
