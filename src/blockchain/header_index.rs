// btoken_node/src/blockchain/header_index.rs
// Arena of headers addressed by id, with a hash-prefix index for lookups.

use std::collections::HashMap;

use crate::blockchain::header::{Header, HeaderId};
use crate::error::ChainError;
use crate::util::Hash;

pub const COUNT_HEADERS_MEDIAN_TIME: usize = 11;

fn prefix(hash: &Hash) -> [u8; 4] {
    [hash[0], hash[1], hash[2], hash[3]]
}

pub struct HeaderIndex {
    headers: Vec<Header>,
    // Collision lists keyed by the first four hash bytes.
    by_prefix: HashMap<[u8; 4], Vec<HeaderId>>,
    // Active chain by height.
    main_chain: Vec<HeaderId>,
}

impl std::fmt::Debug for HeaderIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderIndex")
            .field("headers", &self.headers.len())
            .field("height", &self.height())
            .field("tip", &hex::encode(&self.tip().hash[..8]))
            .finish()
    }
}

impl HeaderIndex {
    pub fn new(mut genesis: Header) -> Self {
        genesis.height = 0;
        // Work is counted from the first block after genesis.
        genesis.difficulty_accumulated = 0.0;
        genesis.previous = None;
        genesis.next = None;
        let mut index = HeaderIndex {
            headers: Vec::new(),
            by_prefix: HashMap::new(),
            main_chain: Vec::new(),
        };
        let id = index.insert(genesis);
        index.main_chain.push(id);
        index
    }

    fn insert(&mut self, header: Header) -> HeaderId {
        let id = self.headers.len();
        self.by_prefix.entry(prefix(&header.hash)).or_default().push(id);
        self.headers.push(header);
        id
    }

    pub fn find(&self, hash: &Hash) -> Option<HeaderId> {
        self.by_prefix
            .get(&prefix(hash))?
            .iter()
            .copied()
            .find(|id| self.headers[*id].hash == *hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.find(hash).is_some()
    }

    pub fn get(&self, id: HeaderId) -> &Header {
        &self.headers[id]
    }

    pub fn header(&self, hash: &Hash) -> Option<&Header> {
        self.find(hash).map(|id| &self.headers[id])
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn genesis(&self) -> &Header {
        &self.headers[self.main_chain[0]]
    }

    pub fn tip_id(&self) -> HeaderId {
        self.main_chain[self.main_chain.len() - 1]
    }

    pub fn tip(&self) -> &Header {
        &self.headers[self.tip_id()]
    }

    pub fn height(&self) -> u32 {
        (self.main_chain.len() - 1) as u32
    }

    pub fn at_height(&self, height: u32) -> Option<&Header> {
        self.main_chain.get(height as usize).map(|id| &self.headers[*id])
    }

    pub fn is_on_main_chain(&self, id: HeaderId) -> bool {
        let height = self.headers[id].height as usize;
        self.main_chain.get(height) == Some(&id)
    }

    /// Links `header` behind the current tip. The caller has validated it.
    pub fn extend_tip(&mut self, mut header: Header) -> HeaderId {
        let tip_id = self.tip_id();
        let tip = &self.headers[tip_id];
        header.previous = Some(tip_id);
        header.next = None;
        header.height = tip.height + 1;
        header.difficulty_accumulated = tip.difficulty_accumulated + header.difficulty;
        let id = self.insert(header);
        self.headers[tip_id].next = Some(id);
        self.main_chain.push(id);
        id
    }

    /// Median timestamp of the last eleven headers ending at `id`.
    pub fn median_time_past(&self, id: HeaderId) -> u32 {
        let mut timestamps = Vec::with_capacity(COUNT_HEADERS_MEDIAN_TIME);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if timestamps.len() == COUNT_HEADERS_MEDIAN_TIME {
                break;
            }
            let header = &self.headers[current];
            timestamps.push(header.timestamp);
            cursor = header.previous;
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }

    /// Sparse ancestor list stepping back 1, 1, 2, 4, 8, ... headers from
    /// the tip and ending at the floor height.
    pub fn locator(&self, floor_height: u32) -> Vec<Hash> {
        let tip_height = self.height();
        let floor = floor_height.min(tip_height);
        let mut locator = Vec::new();
        let mut height = tip_height;
        let mut step = 1u32;
        loop {
            locator.push(self.headers[self.main_chain[height as usize]].hash);
            if height == floor {
                break;
            }
            if locator.len() >= 3 {
                step = step.saturating_mul(2);
            }
            height = if height - floor > step { height - step } else { floor };
        }
        locator
    }

    /// Up to `count` active-chain headers following the first locator hash
    /// found on the active chain, stopping after `hash_stop`.
    pub fn headers_after(&self, locator: &[Hash], count: usize, hash_stop: &Hash) -> Result<Vec<Header>, ChainError> {
        let ancestor = locator
            .iter()
            .filter_map(|hash| self.find(hash))
            .find(|id| self.is_on_main_chain(*id))
            .ok_or_else(|| ChainError::protocol("no locator hash found in local chain"))?;

        let mut headers = Vec::new();
        let mut height = self.headers[ancestor].height as usize + 1;
        while headers.len() < count {
            let Some(id) = self.main_chain.get(height) else { break };
            let header = &self.headers[*id];
            headers.push(header.clone());
            if header.hash == *hash_stop {
                break;
            }
            height += 1;
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainparams::ChainParams;

    fn chain(length: u32) -> HeaderIndex {
        let params = ChainParams::btoken();
        let genesis = Header::new(1, [0u8; 32], [0u8; 32], 0, 0x207fffff, 0, &params);
        let mut index = HeaderIndex::new(genesis);
        for i in 1..=length {
            let header = Header::new(1, index.tip().hash, [0u8; 32], i, 0x207fffff, i, &params);
            index.extend_tip(header);
        }
        index
    }

    #[test]
    fn extension_links_both_directions() {
        let index = chain(3);
        let tip = index.tip();
        assert_eq!(tip.height, 3);
        assert_eq!(tip.difficulty_accumulated, 3.0);
        let previous = index.get(tip.previous.unwrap());
        assert_eq!(previous.next, Some(index.tip_id()));
        assert_eq!(previous.difficulty_accumulated + tip.difficulty, tip.difficulty_accumulated);
        assert_eq!(index.header(&previous.hash).unwrap().height, 2);
    }

    #[test]
    fn prefix_collisions_resolve_by_full_hash() {
        let params = ChainParams::btoken();
        let genesis = Header::new(1, [0u8; 32], [0u8; 32], 0, 0x207fffff, 0, &params);
        let mut index = HeaderIndex::new(genesis);
        let mut a = Header::new(1, index.tip().hash, [0u8; 32], 1, 0x207fffff, 1, &params);
        a.hash = [7u8; 32];
        let id_a = index.extend_tip(a);
        let mut b = Header::new(1, [7u8; 32], [0u8; 32], 2, 0x207fffff, 2, &params);
        b.hash = [7u8; 32];
        b.hash[31] = 8;
        let id_b = index.extend_tip(b.clone());
        assert_eq!(index.find(&[7u8; 32]), Some(id_a));
        assert_eq!(index.find(&b.hash), Some(id_b));
        let mut missing = [7u8; 32];
        missing[20] = 0;
        assert_eq!(index.find(&missing), None);
    }

    #[test]
    fn locator_steps_back_exponentially() {
        let index = chain(20);
        let heights: Vec<u32> = index
            .locator(0)
            .iter()
            .map(|hash| index.header(hash).unwrap().height)
            .collect();
        assert_eq!(heights, vec![20, 19, 18, 16, 12, 4, 0]);
    }

    #[test]
    fn locator_stops_at_floor() {
        let index = chain(20);
        let locator = index.locator(15);
        let last = index.header(locator.last().unwrap()).unwrap();
        assert_eq!(last.height, 15);
    }

    #[test]
    fn headers_after_follows_first_known_locator_hash() {
        let index = chain(10);
        let unknown = [0xeeu8; 32];
        let start = index.at_height(4).unwrap().hash;
        let stop = index.at_height(7).unwrap().hash;
        let headers = index.headers_after(&[unknown, start], 100, &stop).unwrap();
        let heights: Vec<u32> = headers.iter().map(|h| h.height).collect();
        assert_eq!(heights, vec![5, 6, 7]);

        let capped = index.headers_after(&[start], 2, &[0u8; 32]).unwrap();
        assert_eq!(capped.len(), 2);

        assert!(index.headers_after(&[unknown], 10, &[0u8; 32]).unwrap_err().is_protocol());
    }

    #[test]
    fn median_time_of_short_chain() {
        let index = chain(4);
        // timestamps 0,1,2,3,4
        assert_eq!(index.median_time_past(index.tip_id()), 2);
    }
}
