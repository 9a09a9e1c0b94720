use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::device::{CardOpener, PivDevice};
use crate::error::PivError;

/// An open card handle. The mutex is the card's transaction lock.
pub type SharedCard = Arc<Mutex<Box<dyn PivDevice>>>;

/// Open card handles keyed by reader name, so a card is opened at most once
/// per process however many signers use it.
pub struct CardRegistry {
    opener: Box<dyn CardOpener>,
    open: Mutex<HashMap<String, SharedCard>>,
}

impl CardRegistry {
    pub fn new(opener: impl CardOpener + 'static) -> Self {
        Self {
            opener: Box::new(opener),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Open the first card the opener reports.
    pub fn open_first(&self) -> Result<(String, SharedCard), PivError> {
        let name = self
            .opener
            .cards()?
            .into_iter()
            .next()
            .ok_or(PivError::NoDevice)?;
        let card = self.open(&name)?;
        Ok((name, card))
    }

    pub fn open(&self, name: &str) -> Result<SharedCard, PivError> {
        let mut open = self.open.lock().map_err(|_| PivError::Poisoned)?;
        if let Some(card) = open.get(name) {
            return Ok(Arc::clone(card));
        }
        let card: SharedCard = Arc::new(Mutex::new(self.opener.open(name)?));
        debug!(card = name, "opened card");
        open.insert(name.to_string(), Arc::clone(&card));
        Ok(card)
    }

    /// Drop the registry's handle. The card closes once every holder is gone.
    pub fn release(&self, name: &str) -> bool {
        match self.open.lock() {
            Ok(mut open) => open.remove(name).is_some(),
            Err(_) => false,
        }
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.open
            .lock()
            .map(|open| open.contains_key(name))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for CardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .open
            .lock()
            .map(|open| open.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CardRegistry").field("open", &names).finish()
    }
}
