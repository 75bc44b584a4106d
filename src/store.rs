// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Durable DKG state, two entries per beacon: the current state, whatever its
//! status, and the most recent completed one. Writes are atomic per entry, so
//! a crash can never expose a half-written state.

use crate::errors::{Error, Result};
use crate::state::DkgState;

use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

const CURRENT_TREE: &str = "dkg_current";
const FINISHED_TREE: &str = "dkg_finished";

/// Disk storage for per-beacon DKG state.
#[derive(Clone, Debug)]
pub struct DkgStore {
    db: Db,
    current: Tree,
    finished: Tree,
    // Beacons nuked during this process's lifetime. Saves against them fail
    // so a still-running executor cannot resurrect the cleared state; the
    // fence lifts on the next daemon start.
    nuked: Arc<DashSet<String>>,
}

impl DkgStore {
    /// Opens (or creates) the store under the given directory.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        let current = db.open_tree(CURRENT_TREE)?;
        let finished = db.open_tree(FINISHED_TREE)?;
        Ok(Self {
            db,
            current,
            finished,
            nuked: Arc::new(DashSet::new()),
        })
    }

    /// The current state of a beacon. Unknown beacons are `Fresh`, never
    /// an absence.
    pub fn get_current(&self, beacon_id: &str) -> Result<DkgState> {
        match self.current.get(beacon_id)? {
            Some(bytes) => deserialise(&bytes),
            None => Ok(DkgState::fresh(beacon_id)),
        }
    }

    /// Replaces the current state of a beacon.
    pub fn save_current(&self, state: &DkgState) -> Result<()> {
        self.ensure_not_nuked(state.beacon_id())?;
        let bytes = serialise(state)?;
        let _old = self.current.insert(state.beacon_id(), bytes)?;
        Ok(())
    }

    /// The most recent completed state of a beacon, or `None` when no epoch
    /// ever completed.
    pub fn get_finished(&self, beacon_id: &str) -> Result<Option<DkgState>> {
        match self.finished.get(beacon_id)? {
            Some(bytes) => Ok(Some(deserialise(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Records a completed state. The completed state also becomes the
    /// current one; the finished entry is written first so readers never
    /// observe a current `Complete` without its finished counterpart.
    pub fn save_finished(&self, state: &DkgState) -> Result<()> {
        self.ensure_not_nuked(state.beacon_id())?;
        let bytes = serialise(state)?;
        let _old = self.finished.insert(state.beacon_id(), bytes.clone())?;
        let _old = self.current.insert(state.beacon_id(), bytes)?;
        let _flushed = self.db.flush()?;
        Ok(())
    }

    /// Administrative reset of both entries for a beacon. Only safe with the
    /// daemon stopped: the beacon is fenced for the rest of this process's
    /// lifetime, so a still-running executor fails its next save with
    /// `BeaconNuked` instead of resurrecting the cleared state. Reopening
    /// the store on the next start lifts the fence.
    pub fn nuke_state(&self, beacon_id: &str) -> Result<()> {
        let _known = self.nuked.insert(beacon_id.to_string());
        let _old = self.current.remove(beacon_id)?;
        let _old = self.finished.remove(beacon_id)?;
        let _flushed = self.db.flush()?;
        Ok(())
    }

    /// Flushes outstanding writes.
    pub fn close(&self) -> Result<()> {
        let _flushed = self.db.flush()?;
        Ok(())
    }

    fn ensure_not_nuked(&self, beacon_id: &str) -> Result<()> {
        if self.nuked.contains(beacon_id) {
            Err(Error::BeaconNuked)
        } else {
            Ok(())
        }
    }
}

pub(crate) fn serialise<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn deserialise<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
