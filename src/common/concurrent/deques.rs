use crate::common::{
    concurrent::{EntryInfo, KeyDate, KeyHashDate},
    deque::{CacheRegion, DeqNode, Deque},
};

use triomphe::Arc as TrioArc;

/// The access-order and write-order deques of the eviction policy. Owned
/// exclusively by the maintenance task; everything here assumes the
/// eviction lock is held.
pub(crate) struct Deques<K> {
    pub(crate) window: Deque<KeyHashDate<K>>,
    pub(crate) probation: Deque<KeyHashDate<K>>,
    pub(crate) protected: Deque<KeyHashDate<K>>,
    pub(crate) write_order: Deque<KeyDate<K>>,
}

impl<K> Default for Deques<K> {
    fn default() -> Self {
        Self {
            window: Deque::new(CacheRegion::Window),
            probation: Deque::new(CacheRegion::MainProbation),
            protected: Deque::new(CacheRegion::MainProtected),
            write_order: Deque::new(CacheRegion::WriteOrder),
        }
    }
}

impl<K> Deques<K> {
    pub(crate) fn select_ao_mut(&mut self, region: CacheRegion) -> &mut Deque<KeyHashDate<K>> {
        match region {
            CacheRegion::Window => &mut self.window,
            CacheRegion::MainProbation => &mut self.probation,
            CacheRegion::MainProtected => &mut self.protected,
            region => panic!("not an access-order region: {:?}", region),
        }
    }

    /// Links the entry at the tail of the given access-order deque and
    /// records the region and node pointer in the entry.
    pub(crate) fn push_back_ao(&mut self, region: CacheRegion, entry_info: &TrioArc<EntryInfo<K>>) {
        let node = Box::new(DeqNode::new(KeyHashDate::new(TrioArc::clone(entry_info))));
        let ptr = self.select_ao_mut(region).push_back(node);
        entry_info.set_region(region);
        entry_info.nodes().access_order_q_node = Some(ptr);
    }

    pub(crate) fn move_to_back_ao(&mut self, entry_info: &EntryInfo<K>) {
        let ptr = entry_info.nodes().access_order_q_node;
        if let (Some(region), Some(ptr)) = (entry_info.region(), ptr) {
            unsafe { self.select_ao_mut(region).move_to_back(ptr) };
        }
    }

    /// Moves the entry from its current access-order deque to the tail of
    /// another, reusing the node allocation.
    pub(crate) fn transfer_ao(&mut self, to: CacheRegion, entry_info: &EntryInfo<K>) {
        let ptr = entry_info.nodes().access_order_q_node;
        if let (Some(from), Some(ptr)) = (entry_info.region(), ptr) {
            let node = unsafe { self.select_ao_mut(from).unlink(ptr) };
            let ptr = self.select_ao_mut(to).push_back(node);
            entry_info.set_region(to);
            entry_info.nodes().access_order_q_node = Some(ptr);
        }
    }

    pub(crate) fn unlink_ao(&mut self, entry_info: &EntryInfo<K>) {
        let ptr = entry_info.nodes().access_order_q_node.take();
        if let (Some(region), Some(ptr)) = (entry_info.region(), ptr) {
            unsafe { self.select_ao_mut(region).unlink(ptr) };
            entry_info.clear_region();
        }
    }

    pub(crate) fn push_back_wo(&mut self, entry_info: &TrioArc<EntryInfo<K>>) {
        let node = Box::new(DeqNode::new(KeyDate::new(TrioArc::clone(entry_info))));
        let ptr = self.write_order.push_back(node);
        entry_info.nodes().write_order_q_node = Some(ptr);
    }

    pub(crate) fn move_to_back_wo(&mut self, entry_info: &EntryInfo<K>) {
        let ptr = entry_info.nodes().write_order_q_node;
        if let Some(ptr) = ptr {
            unsafe { self.write_order.move_to_back(ptr) };
        }
    }

    pub(crate) fn unlink_wo(&mut self, entry_info: &EntryInfo<K>) {
        if let Some(ptr) = entry_info.nodes().write_order_q_node.take() {
            unsafe { self.write_order.unlink(ptr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Deques;
    use crate::common::{
        concurrent::{EntryInfo, KeyHash},
        deque::CacheRegion,
        time::Instant,
    };

    use std::sync::Arc;
    use triomphe::Arc as TrioArc;

    fn entry(key: u32) -> TrioArc<EntryInfo<u32>> {
        TrioArc::new(EntryInfo::new(
            KeyHash::new(Arc::new(key), key as u64),
            Instant::new(0),
            1,
        ))
    }

    fn keys(deque: &crate::common::deque::Deque<super::KeyHashDate<u32>>) -> Vec<u32> {
        deque.iter().map(|node| **node.element.key()).collect()
    }

    #[test]
    fn region_transfer() {
        let mut deques: Deques<u32> = Deques::default();
        let a = entry(1);
        let b = entry(2);

        deques.push_back_ao(CacheRegion::Window, &a);
        deques.push_back_ao(CacheRegion::Window, &b);
        assert_eq!(keys(&deques.window), vec![1, 2]);

        deques.transfer_ao(CacheRegion::MainProbation, &a);
        assert_eq!(keys(&deques.window), vec![2]);
        assert_eq!(keys(&deques.probation), vec![1]);
        assert_eq!(a.region(), Some(CacheRegion::MainProbation));

        deques.transfer_ao(CacheRegion::MainProtected, &a);
        assert_eq!(keys(&deques.protected), vec![1]);

        deques.unlink_ao(&a);
        assert!(deques.protected.is_empty());
        assert!(a.region().is_none());
        assert!(a.nodes().access_order_q_node.is_none());

        // Unlinking twice is a no-op.
        deques.unlink_ao(&a);
        deques.unlink_ao(&b);
        assert!(deques.window.is_empty());
    }

    #[test]
    fn access_order_recency() {
        let mut deques: Deques<u32> = Deques::default();
        let a = entry(1);
        let b = entry(2);
        let c = entry(3);
        for info in [&a, &b, &c].iter() {
            deques.push_back_ao(CacheRegion::MainProbation, *info);
        }

        deques.move_to_back_ao(&a);
        assert_eq!(keys(&deques.probation), vec![2, 3, 1]);
    }

    #[test]
    fn write_order_fifo() {
        let mut deques: Deques<u32> = Deques::default();
        let a = entry(1);
        let b = entry(2);
        deques.push_back_wo(&a);
        deques.push_back_wo(&b);

        deques.move_to_back_wo(&a);
        let order: Vec<u32> = deques
            .write_order
            .iter()
            .map(|node| **node.element.key())
            .collect();
        assert_eq!(order, vec![2, 1]);

        deques.unlink_wo(&a);
        deques.unlink_wo(&b);
        assert!(deques.write_order.is_empty());
    }
}
