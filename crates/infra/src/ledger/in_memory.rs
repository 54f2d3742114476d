//! In-memory ledger for tests/dev.
//!
//! Each account sits behind its own async mutex, so mutations for one user
//! are serialized while different users proceed in parallel. The std locks
//! only guard the index maps and are never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;

use artforge_core::{Page, PageRequest, PredictionId, UserId};
use artforge_ledger::{
    LedgerEntry, RedemptionCode, Reservation, ReservationId, Reserved, Settlement,
    TransactionKind, UserBalance, normalize_code,
};

use super::{LedgerError, LedgerStore, Redeemed};

#[derive(Debug)]
struct Account {
    balance: UserBalance,
    /// Oldest first.
    entries: Vec<LedgerEntry>,
    reservations: HashMap<ReservationId, Reservation>,
}

#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<UserId, Arc<Mutex<Account>>>>,
    reservation_owner: RwLock<HashMap<ReservationId, UserId>>,
    by_prediction: RwLock<HashMap<PredictionId, ReservationId>>,
    codes: Mutex<HashMap<String, RedemptionCode>>,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Storage("ledger index lock poisoned".to_string())
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn account(&self, user_id: UserId) -> Result<Arc<Mutex<Account>>, LedgerError> {
        self.accounts
            .read()
            .map_err(poisoned)?
            .get(&user_id)
            .cloned()
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    fn owner_of(&self, reservation_id: ReservationId) -> Result<UserId, LedgerError> {
        self.reservation_owner
            .read()
            .map_err(poisoned)?
            .get(&reservation_id)
            .copied()
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))
    }

    fn locate(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<(UserId, ReservationId)>, LedgerError> {
        let reservation_id = self
            .by_prediction
            .read()
            .map_err(poisoned)?
            .get(prediction_id)
            .copied();
        match reservation_id {
            Some(id) => Ok(Some((self.owner_of(id)?, id))),
            None => Ok(None),
        }
    }

    async fn refund_reservation(
        &self,
        user_id: UserId,
        reservation_id: ReservationId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let handle = self.account(user_id)?;
        let mut account = handle.lock().await;

        let mut balance = account.balance.clone();
        let mut reservation = account
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))?;

        let entry = artforge_ledger::refund(&mut balance, &mut reservation, Utc::now())?;

        account.balance = balance;
        account.reservations.insert(reservation.id, reservation);
        if let Some(entry) = &entry {
            account.entries.push(entry.clone());
        }
        Ok(entry)
    }
}

#[async_trait::async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn open_account(&self, user_id: UserId) -> Result<UserBalance, LedgerError> {
        let handle = {
            let mut accounts = self.accounts.write().map_err(poisoned)?;
            accounts
                .entry(user_id)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Account {
                        balance: UserBalance::open(user_id, Utc::now()),
                        entries: Vec::new(),
                        reservations: HashMap::new(),
                    }))
                })
                .clone()
        };
        let account = handle.lock().await;
        Ok(account.balance.clone())
    }

    async fn balance(&self, user_id: UserId) -> Result<Option<UserBalance>, LedgerError> {
        let handle = self.accounts.read().map_err(poisoned)?.get(&user_id).cloned();
        match handle {
            Some(handle) => Ok(Some(handle.lock().await.balance.clone())),
            None => Ok(None),
        }
    }

    async fn check_balance(&self, user_id: UserId, required: u64) -> Result<(), LedgerError> {
        let handle = self.account(user_id)?;
        let account = handle.lock().await;
        account.balance.ensure_covers(required)?;
        Ok(())
    }

    async fn reserve(&self, user_id: UserId, points: u64) -> Result<Reservation, LedgerError> {
        let handle = self.account(user_id)?;
        let reservation = {
            let mut account = handle.lock().await;
            let mut balance = account.balance.clone();
            let Reserved { reservation, entry } =
                artforge_ledger::reserve(&mut balance, points, Utc::now())?;

            account.balance = balance;
            account.reservations.insert(reservation.id, reservation.clone());
            if let Some(entry) = entry {
                account.entries.push(entry);
            }
            reservation
        };
        self.reservation_owner
            .write()
            .map_err(poisoned)?
            .insert(reservation.id, user_id);
        Ok(reservation)
    }

    async fn attach(
        &self,
        reservation_id: ReservationId,
        prediction_id: &PredictionId,
    ) -> Result<Reservation, LedgerError> {
        let handle = self.account(self.owner_of(reservation_id)?)?;
        let mut account = handle.lock().await;
        let reservation = account
            .reservations
            .get_mut(&reservation_id)
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))?;

        let mut index = self.by_prediction.write().map_err(poisoned)?;
        if let Some(existing) = index.get(prediction_id) {
            if *existing != reservation_id {
                return Err(LedgerError::Conflict(format!(
                    "prediction {prediction_id} already holds reservation {existing}"
                )));
            }
        }
        reservation.attach(prediction_id.clone())?;
        index.insert(prediction_id.clone(), reservation_id);
        Ok(reservation.clone())
    }

    async fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let user_id = self.owner_of(reservation_id)?;
        self.refund_reservation(user_id, reservation_id).await
    }

    async fn commit(&self, prediction_id: &PredictionId) -> Result<Settlement, LedgerError> {
        let (user_id, reservation_id) = self
            .locate(prediction_id)?
            .ok_or_else(|| LedgerError::ReservationNotFound(prediction_id.to_string()))?;
        let handle = self.account(user_id)?;
        let mut account = handle.lock().await;
        let reservation = account
            .reservations
            .get_mut(&reservation_id)
            .ok_or_else(|| LedgerError::ReservationNotFound(reservation_id.to_string()))?;
        Ok(reservation.commit(Utc::now())?)
    }

    async fn refund(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let (user_id, reservation_id) = self
            .locate(prediction_id)?
            .ok_or_else(|| LedgerError::ReservationNotFound(prediction_id.to_string()))?;
        self.refund_reservation(user_id, reservation_id).await
    }

    async fn credit(
        &self,
        user_id: UserId,
        points: u64,
        kind: TransactionKind,
        metadata: serde_json::Value,
    ) -> Result<LedgerEntry, LedgerError> {
        let handle = self.account(user_id)?;
        let mut account = handle.lock().await;
        let mut balance = account.balance.clone();
        let entry = artforge_ledger::credit(&mut balance, points, kind, metadata, Utc::now())?;
        account.balance = balance;
        account.entries.push(entry.clone());
        Ok(entry)
    }

    async fn reservation(
        &self,
        prediction_id: &PredictionId,
    ) -> Result<Option<Reservation>, LedgerError> {
        let Some((user_id, reservation_id)) = self.locate(prediction_id)? else {
            return Ok(None);
        };
        let handle = self.account(user_id)?;
        let account = handle.lock().await;
        Ok(account.reservations.get(&reservation_id).cloned())
    }

    async fn transactions(
        &self,
        user_id: UserId,
        page: PageRequest,
    ) -> Result<Page<LedgerEntry>, LedgerError> {
        let handle = self.accounts.read().map_err(poisoned)?.get(&user_id).cloned();
        let Some(handle) = handle else {
            return Ok(Page::from_vec(Vec::new(), page));
        };
        let account = handle.lock().await;
        let newest_first: Vec<LedgerEntry> = account.entries.iter().rev().cloned().collect();
        Ok(Page::from_vec(newest_first, page))
    }

    async fn create_code(&self, code: RedemptionCode) -> Result<(), LedgerError> {
        let mut codes = self.codes.lock().await;
        if codes.contains_key(&code.code) {
            return Err(LedgerError::Conflict(format!("code {} already exists", code.code)));
        }
        codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn redeem(&self, user_id: UserId, code: &str) -> Result<Redeemed, LedgerError> {
        let key = normalize_code(code);
        let mut codes = self.codes.lock().await;
        let mut redemption = codes.get(&key).cloned().ok_or(LedgerError::CodeNotFound)?;

        let handle = self.account(user_id)?;
        let mut account = handle.lock().await;
        let mut balance = account.balance.clone();
        let entry = artforge_ledger::redeem(&mut balance, &mut redemption, Utc::now())?;

        account.balance = balance.clone();
        if let Some(entry) = &entry {
            account.entries.push(entry.clone());
        }
        codes.insert(key, redemption);
        Ok(Redeemed { balance, entry })
    }
}
