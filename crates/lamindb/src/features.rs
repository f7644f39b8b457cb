//! Feature sets attached to a host, one per slot.

use std::collections::BTreeMap;

use recdb::{field_value, Link, Model, RecDbError, Storage, DEFAULT_DB};
use tracing::info;

use crate::host::{Host, HostRef};
use crate::instance::Session;
use crate::record::{downcast_all, with_member_kind, AnyRecord, MemberRecord, Record};
use crate::schema::FeatureSet;
use crate::settings::Verbosity;
use crate::transfer::{transfer_to_default_db, FkCache};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureManager {
    host: HostRef,
    db: String,
}

impl FeatureManager {
    /// Manager for a host on the default database.
    pub fn new<H: Host>(host: &H) -> Result<Self> {
        Self::on(host, DEFAULT_DB)
    }

    /// Manager for a host read from `db`.
    pub fn on<H: Host>(host: &H, db: &str) -> Result<Self> {
        Ok(Self::from_ref(host.host_ref()?, db))
    }

    pub fn from_ref(host: HostRef, db: &str) -> Self {
        Self { host, db: db.to_string() }
    }

    pub fn host(&self) -> HostRef {
        self.host
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn feature_sets_by_slot<S: Storage>(&self, session: &Session<'_, S>) -> Result<BTreeMap<String, FeatureSet>> {
        let database = session.using(&self.db)?;
        let mut out = BTreeMap::new();
        for link in database.links(self.host.kind.feature_sets_relation(), self.host.id)? {
            let fs: FeatureSet = database.get(link.right)?.ok_or(RecDbError::MissingRow {
                registry: FeatureSet::REGISTRY,
                id: link.right,
            })?;
            out.insert(link.slot.unwrap_or_default(), fs);
        }
        Ok(out)
    }

    /// Link `fs` under `slot`, replacing whatever set held the slot before.
    pub fn add_feature_set<S: Storage>(
        &self,
        session: &mut Session<'_, S>,
        fs: &mut FeatureSet,
        slot: &str,
    ) -> Result<()> {
        if self.db != DEFAULT_DB {
            return Err(Error::Value("can only add feature sets to a host on the default database".into()));
        }
        if !fs.is_persisted() {
            fs.save(session)?;
        }
        let fs_id = fs.id.ok_or_else(|| Error::Runtime("feature set has no id after save".into()))?;

        let relation = self.host.kind.feature_sets_relation();
        let db = session.default_db_mut();
        for link in db.links(relation, self.host.id)? {
            if link.slot.as_deref() == Some(slot) && link.right != fs_id {
                db.unlink(&link)?;
            }
        }
        db.link(Link::new(relation, self.host.id, fs_id).with_slot(slot))?;
        Ok(())
    }

    /// Re-create every slot of `source` on this host: members are transferred
    /// to the default database and each slot's set is derived again by hash.
    pub fn add_from<S: Storage>(&self, session: &mut Session<'_, S>, source: &FeatureManager) -> Result<()> {
        let mut cache = FkCache::new();
        for (slot, fs) in source.feature_sets_by_slot(session)? {
            let members = fs.members(session, &source.db)?;
            if members.is_empty() {
                continue;
            }
            let transferred = with_member_kind!(fs.member_kind()?, R => {
                transfer_members::<R, S>(session, members, &source.db, &mut cache)
            })?;
            if session.logs(Verbosity::Info) {
                info!(slot = %slot, registry = %fs.registry, n = transferred.len(), "transferring feature set");
            }
            let mut derived = FeatureSet::new(session, transferred, fs.kind.map(|k| k.as_str()), fs.name.as_deref())?;
            derived.save(session)?;
            self.add_feature_set(session, &mut derived, &slot)?;
        }
        Ok(())
    }
}

/// Default-db equivalents of `members`, matched on the unique field and
/// copied over when absent.
fn transfer_members<R: MemberRecord, S: Storage>(
    session: &mut Session<'_, S>,
    members: Vec<AnyRecord>,
    origin: &str,
    cache: &mut FkCache,
) -> Result<Vec<AnyRecord>> {
    let mut out = Vec::with_capacity(members.len());
    for mut record in downcast_all::<R>(members)? {
        let value = field_value(&record, R::UNIQUE_FIELD)?;
        if let Some(existing) = session.default_db().filter::<R>(R::UNIQUE_FIELD, &value)?.into_iter().next() {
            out.push(existing.into_any());
            continue;
        }
        match transfer_to_default_db(session, &mut record, origin, true, true, true, cache)? {
            Some(existing) => out.push(existing.into_any()),
            None => {
                if !record.is_persisted() {
                    session.default_db_mut().insert(&mut record)?;
                }
                out.push(record.into_any());
            }
        }
    }
    Ok(out)
}
