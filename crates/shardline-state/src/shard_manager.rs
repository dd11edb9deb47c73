// Dynamic sharding manager.
//
// Contract placement and load reach the manager as committed transactions
// (see `apply_committed`), so every member of a shard applies them in the same
// order and the members' tables agree. Chains exist for every shard; only
// chains the local node belongs to are running.
//
// SAFETY INVARIANTS:
// 1. Split and merge never drop or duplicate a contract or a node
// 2. `load` of a shard equals the sum of its contracts' transaction counts
// 3. `shards` is in creation order; merges always take the two newest
// 4. The table lock is released before any chain is touched

use crate::config::ShardingConfig;
use crate::error::ShardingError;
use crate::shard::{Node, Shard, SmartContract};
use log::{debug, info, warn};
use parking_lot::Mutex;
use shardline_consensus::ChainRegistry;
use shardline_core::{NodeId, ShardId, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ShardTable {
    shards: Vec<Shard>,
    next_shard_id: u64,
}

impl ShardTable {
    fn open_shard(&mut self, capacity: usize) -> &mut Shard {
        let id = ShardId(self.next_shard_id);
        self.next_shard_id += 1;
        self.shards.push(Shard::new(id, capacity));
        let last = self.shards.len() - 1;
        &mut self.shards[last]
    }

    fn find(&self, id: ShardId) -> Option<&Shard> {
        self.shards.iter().find(|shard| shard.id == id)
    }

    fn find_mut(&mut self, id: ShardId) -> Option<&mut Shard> {
        self.shards.iter_mut().find(|shard| shard.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    pub original: ShardId,
    pub halves: [ShardId; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub survivor: ShardId,
    pub dissolved: ShardId,
    pub contracts: usize,
    pub nodes: usize,
}

/// Chain work left over after a split, applied once the table lock is gone.
struct SplitPlan {
    report: SplitReport,
    original_members: Vec<NodeId>,
    half_members: [Vec<NodeId>; 2],
}

struct MergePlan {
    report: MergeReport,
    survivor_members: Vec<NodeId>,
    dissolved_members: Vec<NodeId>,
}

pub struct ShardManager {
    local_id: NodeId,
    config: ShardingConfig,
    chains: Arc<ChainRegistry>,
    table: Mutex<ShardTable>,
}

impl ShardManager {
    pub fn new(config: ShardingConfig, chains: Arc<ChainRegistry>) -> Self {
        Self {
            local_id: chains.local_id().clone(),
            config,
            chains,
            table: Mutex::new(ShardTable::default()),
        }
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn chains(&self) -> &Arc<ChainRegistry> {
        &self.chains
    }

    // ============ Placement ============

    /// Places a contract in the first shard with room, in creation order,
    /// opening a new shard when all are full.
    pub fn assign_contract(&self, contract: SmartContract) -> Result<ShardId, ShardingError> {
        let (shard_id, opened) = {
            let mut table = self.table.lock();
            if let Some(shard) = table.shards.iter().find(|s| s.contains_contract(&contract.id)) {
                return Err(ShardingError::ContractAlreadyAssigned {
                    contract: contract.id,
                    shard: shard.id,
                });
            }
            let existing = table.shards.iter_mut().find(|shard| shard.has_room());
            match existing {
                Some(shard) => {
                    shard.push_contract(contract);
                    (shard.id, None)
                }
                None => {
                    let shard = table.open_shard(self.config.shard_capacity);
                    shard.push_contract(contract);
                    (shard.id, Some(shard.node_ids()))
                }
            }
        };
        if let Some(members) = opened {
            info!("[ShardManager] All shards full, opened shard {}", shard_id);
            self.sync_chain(shard_id, &members);
        }
        debug!("[ShardManager] Contract assigned to shard {}", shard_id);
        Ok(shard_id)
    }

    /// Opens an empty shard and registers its chain.
    pub fn create_new_shard(&self) -> ShardId {
        let shard_id = self.table.lock().open_shard(self.config.shard_capacity).id;
        info!("[ShardManager] Created shard {}", shard_id);
        self.sync_chain(shard_id, &[]);
        shard_id
    }

    /// Places a node in the least-loaded shard (oldest on ties). A node that
    /// is already placed stays where it is.
    pub fn handle_new_node(&self, node: Node) -> ShardId {
        let (shard_id, members) = {
            let mut table = self.table.lock();
            if let Some(shard) = table.shards.iter().find(|s| s.contains_node(&node.id)) {
                return shard.id;
            }
            if table.shards.is_empty() {
                table.open_shard(self.config.shard_capacity);
            }
            let mut target = 0;
            for (index, shard) in table.shards.iter().enumerate() {
                if shard.load < table.shards[target].load {
                    target = index;
                }
            }
            let shard = &mut table.shards[target];
            info!("[ShardManager] Node {} joins shard {}", node.id, shard.id);
            shard.push_node(node);
            (shard.id, shard.node_ids())
        };
        self.sync_chain(shard_id, &members);
        shard_id
    }

    /// Counts one transaction against a contract, then splits overloaded
    /// shards.
    pub fn log_load(&self, shard_id: ShardId, contract_id: &str) -> Result<Vec<SplitReport>, ShardingError> {
        {
            let mut table = self.table.lock();
            let shard = table.find_mut(shard_id).ok_or(ShardingError::ShardNotFound(shard_id))?;
            let contract = shard
                .contracts
                .iter_mut()
                .find(|contract| contract.id == contract_id)
                .ok_or_else(|| ShardingError::ContractNotFound {
                    shard: shard_id,
                    contract: contract_id.to_string(),
                })?;
            contract.transaction_count += 1;
            shard.load += 1;
        }
        Ok(self.check_and_split_shards())
    }

    // ============ Committed inputs ============

    /// Applies one transaction committed in `shard_id` to the table.
    ///
    /// Contract assignments place the contract; any other transaction
    /// addressed to a contract counts against the shard now holding it.
    /// Responses are forwarded outside consensus and never count.
    pub fn apply_committed(&self, shard_id: ShardId, trx: &Transaction) {
        let Some(contract_id) = trx.contract.as_deref() else {
            return;
        };
        if trx.is_contract_assignment() {
            match self.assign_contract(SmartContract::new(contract_id)) {
                Ok(placed) => info!(
                    "[ShardManager] Contract {} placed in shard {} (committed in {})",
                    contract_id, placed, shard_id
                ),
                Err(e @ ShardingError::ContractAlreadyAssigned { .. }) => debug!("[ShardManager] {}", e),
                Err(e) => warn!("[ShardManager] Cannot place contract {}: {}", contract_id, e),
            }
            return;
        }
        if trx.is_response() {
            return;
        }
        let Some(current) = self.shard_of_contract(contract_id) else {
            warn!(
                "[ShardManager] Committed transaction for unknown contract {} in shard {}",
                contract_id, shard_id
            );
            return;
        };
        match self.log_load(current, contract_id) {
            Ok(reports) => {
                for report in reports {
                    info!(
                        "[ShardManager] Load on {} split shard {} into {:?}",
                        contract_id, report.original, report.halves
                    );
                }
            }
            Err(e) => warn!("[ShardManager] Load for {} not counted: {}", contract_id, e),
        }
    }

    // ============ Split ============

    /// Splits every shard holding more than `split_threshold` contracts.
    pub fn check_and_split_shards(&self) -> Vec<SplitReport> {
        let plans = {
            let mut table = self.table.lock();
            let overloaded: Vec<ShardId> = table
                .shards
                .iter()
                .filter(|shard| shard.contracts.len() > self.config.split_threshold)
                .map(|shard| shard.id)
                .collect();
            overloaded
                .into_iter()
                .filter_map(|id| self.split_shard(&mut table, id))
                .collect::<Vec<_>>()
        };

        plans
            .into_iter()
            .map(|plan| {
                self.apply_split(&plan);
                plan.report
            })
            .collect()
    }

    fn split_shard(&self, table: &mut ShardTable, shard_id: ShardId) -> Option<SplitPlan> {
        let index = table.shards.iter().position(|shard| shard.id == shard_id)?;
        let mut original = table.shards.remove(index);
        let original_members = original.node_ids();

        let first = table.open_shard(self.config.shard_capacity).id;
        let second = table.open_shard(self.config.shard_capacity).id;
        let mut halves = [
            Shard::new(first, self.config.shard_capacity),
            Shard::new(second, self.config.shard_capacity),
        ];

        // Heaviest contracts first, each to the lighter half; equal loads go
        // to the half with fewer contracts.
        original
            .contracts
            .sort_by(|a, b| b.transaction_count.cmp(&a.transaction_count));
        for contract in original.contracts.drain(..) {
            let weight = |shard: &Shard| (shard.load, shard.contracts.len());
            let lighter = usize::from(weight(&halves[1]) < weight(&halves[0]));
            halves[lighter].push_contract(contract);
        }
        for node in original.nodes.drain(..) {
            let smaller = usize::from(halves[1].nodes.len() < halves[0].nodes.len());
            halves[smaller].push_node(node);
        }

        let half_members = [halves[0].node_ids(), halves[1].node_ids()];
        info!(
            "[ShardManager] Split shard {} into {} ({} contracts) and {} ({} contracts)",
            shard_id,
            first,
            halves[0].contracts.len(),
            second,
            halves[1].contracts.len()
        );
        for half in halves {
            if let Some(slot) = table.find_mut(half.id) {
                *slot = half;
            }
        }

        Some(SplitPlan {
            report: SplitReport {
                original: shard_id,
                halves: [first, second],
            },
            original_members,
            half_members,
        })
    }

    fn apply_split(&self, plan: &SplitPlan) {
        let local_was_member = plan.original_members.contains(&self.local_id);
        let own = match self.chains.remove(plan.report.original) {
            Some(chain) if local_was_member => chain.take_own_transactions(),
            _ => Vec::new(),
        };

        for (half, members) in plan.report.halves.iter().zip(plan.half_members.iter()) {
            self.sync_chain(*half, members);
            if members.contains(&self.local_id) && !own.is_empty() {
                if let Some(chain) = self.chains.get(*half) {
                    info!(
                        "[ShardManager] Re-proposing {} transactions in shard {}",
                        own.len(),
                        half
                    );
                    chain.absorb_transactions(own.clone());
                }
            }
        }
    }

    // ============ Merge ============

    /// Merges the two newest shards when together they hold at most
    /// `merge_threshold` contracts.
    pub fn check_and_merge_shards(&self) -> Result<Option<MergeReport>, ShardingError> {
        let underloaded = {
            let table = self.table.lock();
            let count = table.shards.len();
            count >= 2
                && table.shards[count - 2].contracts.len() + table.shards[count - 1].contracts.len()
                    <= self.config.merge_threshold
        };
        if !underloaded {
            return Ok(None);
        }
        self.merge_latest_shards().map(Some)
    }

    /// Folds the newest shard into the one created before it.
    pub fn merge_latest_shards(&self) -> Result<MergeReport, ShardingError> {
        let plan = {
            let mut table = self.table.lock();
            let count = table.shards.len();
            if count < 2 {
                return Err(ShardingError::NotEnoughShards(count));
            }
            let dissolved = table.shards.pop().ok_or(ShardingError::NotEnoughShards(count))?;
            let dissolved_members = dissolved.node_ids();
            let survivor = table
                .shards
                .last_mut()
                .ok_or(ShardingError::NotEnoughShards(count))?;
            let survivor_members = survivor.node_ids();

            for contract in dissolved.contracts {
                survivor.push_contract(contract);
            }
            for node in dissolved.nodes {
                if !survivor.contains_node(&node.id) {
                    survivor.push_node(node);
                }
            }
            info!(
                "[ShardManager] Merged shard {} into {} ({} contracts, {} nodes)",
                dissolved.id,
                survivor.id,
                survivor.contracts.len(),
                survivor.nodes.len()
            );
            MergePlan {
                report: MergeReport {
                    survivor: survivor.id,
                    dissolved: dissolved.id,
                    contracts: survivor.contracts.len(),
                    nodes: survivor.nodes.len(),
                },
                survivor_members,
                dissolved_members,
            }
        };
        self.do_post_merge(&plan);
        Ok(plan.report)
    }

    /// Moves the dissolved chain's work into the survivor.
    ///
    /// Response transactions go straight to the pipeline. When some node sat
    /// in both shards it interleaves the two queues and broadcasts the result;
    /// otherwise every origin re-proposes its own pending transactions.
    fn do_post_merge(&self, plan: &MergePlan) {
        let survivor_id = plan.report.survivor;
        let dissolved_id = plan.report.dissolved;
        let in_survivor = plan.survivor_members.contains(&self.local_id);
        let in_dissolved = plan.dissolved_members.contains(&self.local_id);
        let bridged = plan
            .dissolved_members
            .iter()
            .any(|id| plan.survivor_members.contains(id));

        let dissolved = self.chains.remove(dissolved_id);
        let members: BTreeSet<NodeId> = plan
            .survivor_members
            .iter()
            .chain(plan.dissolved_members.iter())
            .cloned()
            .collect();
        let members: Vec<NodeId> = members.into_iter().collect();
        self.sync_chain(survivor_id, &members);

        let (Some(dissolved), true) = (dissolved, in_dissolved) else {
            return;
        };
        let Some(survivor) = self.chains.get(survivor_id) else {
            warn!("[ShardManager] Survivor shard {} has no chain", survivor_id);
            return;
        };

        self.chains
            .forward_to_pipeline(dissolved_id, dissolved.take_responses());

        if bridged && in_survivor {
            survivor.try_merge(dissolved.take_pending_events());
            survivor.absorb_transactions(dissolved.take_leftovers());
            return;
        }

        let carried = if bridged {
            dissolved.take_leftovers()
        } else {
            dissolved.take_own_transactions()
        };
        if carried.is_empty() {
            return;
        }
        match survivor.hand_off_transactions(carried) {
            Ok(()) => info!("[ShardManager] Handed leftovers of shard {} to shard {}", dissolved_id, survivor_id),
            Err(carried) => survivor.absorb_transactions(carried),
        }
    }

    // ============ Chains ============

    /// Makes the chain's membership match the shard and runs it when the
    /// local node is a member.
    fn sync_chain(&self, shard_id: ShardId, members: &[NodeId]) {
        let chain = self.chains.create(shard_id);
        chain.set_members(members.iter().cloned());
        if members.contains(&self.local_id) {
            chain.run();
        }
    }

    // ============ Queries ============

    /// Shards in creation order.
    pub fn shards(&self) -> Vec<Shard> {
        self.table.lock().shards.clone()
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<Shard> {
        self.table.lock().find(shard_id).cloned()
    }

    pub fn shard_count(&self) -> usize {
        self.table.lock().shards.len()
    }

    /// Shards the local node belongs to.
    pub fn local_shards(&self) -> Vec<ShardId> {
        self.table
            .lock()
            .shards
            .iter()
            .filter(|shard| shard.contains_node(&self.local_id))
            .map(|shard| shard.id)
            .collect()
    }

    pub fn shard_of_contract(&self, contract_id: &str) -> Option<ShardId> {
        self.table
            .lock()
            .shards
            .iter()
            .find(|shard| shard.contains_contract(contract_id))
            .map(|shard| shard.id)
    }

    pub fn shard_of_node(&self, node_id: &NodeId) -> Option<ShardId> {
        self.table
            .lock()
            .shards
            .iter()
            .find(|shard| shard.contains_node(node_id))
            .map(|shard| shard.id)
    }
}
