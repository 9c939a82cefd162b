// btoken_node/src/p2p/header_download.rs
// Accumulates the headers a peer sends in answer to a locator.

use crate::blockchain::header::Header;
use crate::error::{ChainError, Result};
use crate::util::Hash;

#[derive(Debug)]
pub struct HeaderDownload {
    locator: Vec<Hash>,
    /// Locator header the received headers build on.
    pub header_ancestor: Option<Header>,
    /// First header not known locally.
    pub header_root: Option<Header>,
    headers: Vec<Header>,
}

impl HeaderDownload {
    pub fn new(locator: Vec<Hash>) -> Self {
        HeaderDownload { locator, header_ancestor: None, header_root: None, headers: Vec::new() }
    }

    /// Locator for the follow-up request: the last header received, or the
    /// original locator if nothing arrived yet.
    pub fn locator_continuation(&self) -> Vec<Hash> {
        match self.headers.last() {
            Some(tip) => vec![tip.hash],
            None => self.locator.clone(),
        }
    }

    /// Appends `header`. The first one must build on a locator hash; each
    /// later one on its predecessor. `lookup` resolves locator hashes to local
    /// headers, `validate` applies the chain's rules at the computed height.
    pub fn insert_header<F, V>(&mut self, mut header: Header, lookup: F, validate: V) -> Result<()>
    where
        F: FnOnce(&Hash) -> Option<Header>,
        V: FnOnce(&Header, u32) -> Result<()>,
    {
        if self.locator.contains(&header.hash) {
            return Err(ChainError::protocol(format!(
                "peer resent locator header {}",
                hex::encode(&header.hash[..8])
            )));
        }
        let (height_parent, difficulty_parent) = match self.headers.last() {
            Some(last) => {
                if header.hash_previous != last.hash {
                    return Err(ChainError::protocol(format!(
                        "header {} out of order: builds on {}, expected {}",
                        hex::encode(&header.hash[..8]),
                        hex::encode(&header.hash_previous[..8]),
                        hex::encode(&last.hash[..8])
                    )));
                }
                (last.height, last.difficulty_accumulated)
            }
            None => {
                if !self.locator.contains(&header.hash_previous) {
                    return Err(ChainError::protocol(format!(
                        "first header {} does not build on the locator",
                        hex::encode(&header.hash[..8])
                    )));
                }
                let ancestor = lookup(&header.hash_previous)
                    .ok_or_else(|| ChainError::protocol("locator ancestor missing from local index"))?;
                let parent = (ancestor.height, ancestor.difficulty_accumulated);
                self.header_ancestor = Some(ancestor);
                parent
            }
        };

        let height = height_parent + 1;
        validate(&header, height)?;
        header.height = height;
        header.difficulty_accumulated = difficulty_parent + header.difficulty;
        header.location = None;
        if self.header_root.is_none() {
            self.header_root = Some(header.clone());
        }
        self.headers.push(header);
        Ok(())
    }

    /// The peer's claimed tip.
    pub fn header_tip(&self) -> Option<&Header> {
        self.headers.last()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }
}
