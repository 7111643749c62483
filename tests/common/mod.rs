use alloy::primitives::{Address, I256, U256};

use eigenswarm::model::eigen::{Eigen, EigenClass, EigenStatus};
use eigenswarm::model::pool::{PoolDescriptor, PoolVersion};
use eigenswarm::registry::{Db, EigenRegistry, open_in_memory};

pub fn addr(n: u8) -> Address {
    Address::repeat_byte(n)
}

pub fn eth(milli: u64) -> U256 {
    U256::from(milli) * U256::from(1_000_000_000_000_000u64)
}

pub fn v3_pool() -> PoolDescriptor {
    PoolDescriptor {
        version: PoolVersion::V3,
        pool: Some(addr(0x30)),
        pool_id: None,
        token0: addr(0x20),
        token1: addr(0x21),
        fee: 3000,
        tick_spacing: Some(60),
        router: addr(0x40),
    }
}

pub fn test_eigen(id: &str) -> Eigen {
    let class = EigenClass::Lite;
    let now = 1_750_000_000;
    Eigen {
        id: id.to_string(),
        owner: addr(0x01),
        agent_identity: None,
        chain_id: 143,
        token: addr(0x20),
        pool: v3_pool(),
        class,
        config: class.default_config(),
        deposited_wei: U256::ZERO,
        balance_wei: U256::ZERO,
        reserved_wei: U256::ZERO,
        token_balance: U256::ZERO,
        average_entry_wei: U256::ZERO,
        realized_pnl_wei: I256::ZERO,
        gas_spent_wei: U256::ZERO,
        fee_accrued_wei: U256::ZERO,
        volume_produced_wei: U256::ZERO,
        volume_cap_wei: eth(50),
        trade_count: 0,
        buy_count: 0,
        sell_count: 0,
        status: EigenStatus::PendingFunding,
        created_at: now,
        updated_at: now,
        terminated_at: None,
        expires_at: now + 86_400,
    }
}

pub async fn fresh_registry() -> (EigenRegistry, Db) {
    let db = open_in_memory().expect("in-memory db");
    (EigenRegistry::new(db.clone()), db)
}
