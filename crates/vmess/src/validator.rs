//! Registry of accepted users, looked up by auth id.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crc::{Crc, CRC_64_XZ};
use fnv::FnvHashMap;
use log::{debug, warn};

use crate::{
    antireplay::AntiReplayWindow,
    auth_id::{AuthIdDecoder, AUTH_ID_LEN},
    clock::{Clock, SystemClock},
    error::{Error, Result},
    user::User,
};

/// Largest accepted distance between an auth id's timestamp and now.
pub const MAX_TIME_DIFF: i64 = 120;

/// How long a seen auth id is remembered, in seconds.
pub const DEFAULT_REPLAY_WINDOW: i64 = 120;

/// Same table and framing as Go's `crc64.ECMA`.
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

struct Entry<T> {
    decoder: AuthIdDecoder,
    ticket: T,
}

struct Users<T> {
    entries: FnvHashMap<[u8; 16], Entry<T>>,
    /// Ids in the order they were added, for the behavior seed.
    seed_material: Vec<u8>,
    behavior_seed: Option<u64>,
}

/// Maps command keys to opaque tickets and matches incoming auth ids.
///
/// Matching scans users in hash map order, which is not the order they
/// were added in.
pub struct Validator<T> {
    users: Mutex<Users<T>>,
    replay: AntiReplayWindow,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> Validator<T> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_REPLAY_WINDOW)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, replay_window: i64) -> Self {
        Self::with_replay_window(
            clock.clone(),
            AntiReplayWindow::with_clock(replay_window, clock),
        )
    }

    pub fn with_replay_window(clock: Arc<dyn Clock>, replay: AntiReplayWindow) -> Self {
        Self {
            users: Mutex::new(Users {
                entries: FnvHashMap::default(),
                seed_material: Vec::new(),
                behavior_seed: None,
            }),
            replay,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Users<T>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `ticket` under `cmd_key`. The key itself feeds the behavior
    /// seed.
    pub fn add_user(&self, cmd_key: [u8; 16], ticket: T) {
        self.insert(cmd_key, &cmd_key, ticket);
    }

    fn insert(&self, cmd_key: [u8; 16], seed: &[u8], ticket: T) {
        let mut users = self.lock();
        if users.behavior_seed.is_none() {
            users.seed_material.extend_from_slice(seed);
        }
        users.entries.insert(
            cmd_key,
            Entry {
                decoder: AuthIdDecoder::new(&cmd_key),
                ticket,
            },
        );
    }

    /// Returns whether the user was registered.
    pub fn remove_user(&self, cmd_key: &[u8; 16]) -> bool {
        self.lock().entries.remove(cmd_key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the user an auth id was created for.
    ///
    /// Users whose key yields a bad checksum or a stale timestamp are skipped.
    /// The first user that passes both checks ends the scan: either the auth id
    /// is fresh and its ticket is returned, or it was seen before and
    /// `Error::Replay` is returned without trying anyone else.
    pub fn match_auth_id(&self, auth_id: &[u8; AUTH_ID_LEN]) -> Result<T> {
        let now = self.clock.now();
        let users = self.lock();

        for entry in users.entries.values() {
            let decoded = entry.decoder.decode(auth_id);
            if !decoded.checksum_valid() {
                continue;
            }
            if decoded.timestamp.abs_diff(now) > MAX_TIME_DIFF as u64 {
                debug!(
                    "auth id timestamp {} too far from {}, skipping",
                    decoded.timestamp, now
                );
                continue;
            }
            if !self.replay.check(auth_id) {
                warn!("replayed auth id rejected");
                return Err(Error::Replay);
            }
            return Ok(entry.ticket.clone());
        }

        Err(Error::NotFound)
    }

    /// A per-server value derived from the keys registered first.
    ///
    /// It is fixed by the first call so later user changes do not alter it.
    pub fn behavior_seed(&self) -> u64 {
        let mut users = self.lock();
        if let Some(seed) = users.behavior_seed {
            return seed;
        }
        let seed = CRC64.checksum(&users.seed_material);
        users.behavior_seed = Some(seed);
        users.seed_material = Vec::new();
        seed
    }
}

impl Validator<User> {
    /// Registers an account, feeding its uuid into the behavior seed so the
    /// drain size matches other servers configured with the same users.
    pub fn add_account(&self, user: User) {
        let id = user.id.id;
        self.insert(*user.cmd_key(), id.as_bytes(), user);
    }
}

impl<T: Clone> Default for Validator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::{auth_id::create_auth_id, clock::ManualClock};

    const NOW: i64 = 1_700_000_000;

    fn validator() -> (Arc<ManualClock>, Validator<usize>) {
        let clock = Arc::new(ManualClock::new(NOW));
        (clock.clone(), Validator::with_clock(clock, 120))
    }

    fn keys(n: usize) -> Vec<[u8; 16]> {
        let mut rng = rand::thread_rng();
        (0..n).map(|_| rng.gen()).collect()
    }

    #[test]
    fn matches_each_registered_user() {
        let (_clock, validator) = validator();
        let keys = keys(8);
        for (i, key) in keys.iter().enumerate() {
            validator.add_user(*key, i);
        }

        for (i, key) in keys.iter().enumerate() {
            let auth_id = create_auth_id(key, NOW);
            assert_eq!(validator.match_auth_id(&auth_id).unwrap(), i);
        }
    }

    #[test]
    fn unknown_key_is_not_found() {
        let (_clock, validator) = validator();
        validator.add_user([1u8; 16], 1);

        let auth_id = create_auth_id(&[2u8; 16], NOW);
        assert!(matches!(validator.match_auth_id(&auth_id), Err(Error::NotFound)));
    }

    #[test]
    fn replayed_auth_id_is_rejected() {
        let (_clock, validator) = validator();
        validator.add_user([1u8; 16], 1);

        let auth_id = create_auth_id(&[1u8; 16], NOW);
        assert_eq!(validator.match_auth_id(&auth_id).unwrap(), 1);
        assert!(matches!(validator.match_auth_id(&auth_id), Err(Error::Replay)));
    }

    #[test]
    fn stale_and_future_timestamps_do_not_match() {
        let (_clock, validator) = validator();
        validator.add_user([1u8; 16], 1);

        let stale = create_auth_id(&[1u8; 16], NOW - MAX_TIME_DIFF - 1);
        assert!(matches!(validator.match_auth_id(&stale), Err(Error::NotFound)));

        let future = create_auth_id(&[1u8; 16], NOW + MAX_TIME_DIFF + 1);
        assert!(matches!(validator.match_auth_id(&future), Err(Error::NotFound)));

        let edge = create_auth_id(&[1u8; 16], NOW - MAX_TIME_DIFF);
        assert_eq!(validator.match_auth_id(&edge).unwrap(), 1);
    }

    #[test]
    fn removed_user_no_longer_matches() {
        let (_clock, validator) = validator();
        validator.add_user([1u8; 16], 1);
        assert!(validator.remove_user(&[1u8; 16]));
        assert!(!validator.remove_user(&[1u8; 16]));
        assert!(validator.is_empty());

        let auth_id = create_auth_id(&[1u8; 16], NOW);
        assert!(matches!(validator.match_auth_id(&auth_id), Err(Error::NotFound)));
    }

    #[test]
    fn behavior_seed_is_fixed_after_first_use() {
        let (_clock, validator) = validator();
        validator.add_user([1u8; 16], 1);
        let seed = validator.behavior_seed();

        validator.add_user([2u8; 16], 2);
        assert_eq!(validator.behavior_seed(), seed);

        let (_clock, other) = validator_with_keys(&[[1u8; 16], [2u8; 16]]);
        assert_ne!(other.behavior_seed(), seed);
    }

    #[test]
    fn account_seed_is_crc64_of_user_ids() {
        // check value of Go's crc64.ECMA table
        assert_eq!(CRC64.checksum(b"123456789"), 0x995d_c9bb_df19_39fa);

        let first = uuid::Uuid::parse_str("b831381d-6324-4d53-ad4f-8cda48b30811").unwrap();
        let second = uuid::Uuid::parse_str("27848739-7e62-4138-9fd3-098a63964b6b").unwrap();
        let validator = Validator::new();
        validator.add_account(User::new(first, 0, None));
        validator.add_account(User::new(second, 0, None));

        let mut ids = first.as_bytes().to_vec();
        ids.extend_from_slice(second.as_bytes());
        assert_eq!(validator.behavior_seed(), CRC64.checksum(&ids));
        assert_eq!(validator.len(), 2);
    }

    fn validator_with_keys(keys: &[[u8; 16]]) -> (Arc<ManualClock>, Validator<usize>) {
        let (clock, validator) = validator();
        for (i, key) in keys.iter().enumerate() {
            validator.add_user(*key, i);
        }
        (clock, validator)
    }
}
