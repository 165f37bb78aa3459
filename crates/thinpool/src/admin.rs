//! Admin message dispatch: the whitespace-token command line a host
//! driver sends down to create, snapshot, delete or trim a thin device, or
//! to recover a transaction id after a crash. Every command that mutates
//! metadata commits before returning, since these calls are rare and their
//! caller expects durability on success.

use std::str::SplitWhitespace;
use std::sync::Arc;

use mapstore::DeviceId;

use crate::error::PoolError;
use crate::pool::PoolInner;

#[derive(Debug, Clone)]
pub(crate) enum AdminCommand {
    CreateThin { dev_id: DeviceId },
    CreateSnap { dev_id: DeviceId, origin_id: DeviceId },
    Delete { dev_id: DeviceId },
    Trim { dev_id: DeviceId, new_size_sectors: u64 },
    SetTransactionId { old: u64, new: u64 },
}

pub(crate) fn parse_u64(tokens: &mut SplitWhitespace<'_>, what: &str) -> Result<u64, PoolError> {
    tokens
        .next()
        .ok_or_else(|| PoolError::Invalid(format!("missing {what}")))?
        .parse()
        .map_err(|_| PoolError::Invalid(format!("invalid {what}")))
}

fn expect_no_more(mut tokens: SplitWhitespace<'_>) -> Result<(), PoolError> {
    if tokens.next().is_some() {
        return Err(PoolError::Invalid("trailing arguments in admin message".into()));
    }
    Ok(())
}

pub(crate) fn parse(line: &str) -> Result<AdminCommand, PoolError> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or_else(|| PoolError::Invalid("empty admin message".into()))?;
    let command = match verb {
        "create_thin" => {
            let dev_id = parse_u64(&mut tokens, "dev_id")? as DeviceId;
            expect_no_more(tokens)?;
            AdminCommand::CreateThin { dev_id }
        }
        "create_snap" => {
            let dev_id = parse_u64(&mut tokens, "dev_id")? as DeviceId;
            let origin_id = parse_u64(&mut tokens, "origin_id")? as DeviceId;
            expect_no_more(tokens)?;
            AdminCommand::CreateSnap { dev_id, origin_id }
        }
        "delete" => {
            let dev_id = parse_u64(&mut tokens, "dev_id")? as DeviceId;
            expect_no_more(tokens)?;
            AdminCommand::Delete { dev_id }
        }
        "trim" => {
            let dev_id = parse_u64(&mut tokens, "dev_id")? as DeviceId;
            let new_size_sectors = parse_u64(&mut tokens, "new_size_sectors")?;
            expect_no_more(tokens)?;
            AdminCommand::Trim { dev_id, new_size_sectors }
        }
        "set_transaction_id" => {
            let old = parse_u64(&mut tokens, "old_transaction_id")?;
            let new = parse_u64(&mut tokens, "new_transaction_id")?;
            expect_no_more(tokens)?;
            AdminCommand::SetTransactionId { old, new }
        }
        other => return Err(PoolError::Invalid(format!("unrecognised admin message: {other}"))),
    };
    Ok(command)
}

pub(crate) fn dispatch(pool: &Arc<PoolInner>, command: AdminCommand) -> Result<String, PoolError> {
    match command {
        AdminCommand::CreateThin { dev_id } => {
            pool.metadata.create_thin(dev_id)?;
            pool.metadata.commit()?;
        }
        AdminCommand::CreateSnap { dev_id, origin_id } => {
            pool.metadata.create_snap(dev_id, origin_id)?;
            pool.metadata.commit()?;
        }
        AdminCommand::Delete { dev_id } => {
            pool.metadata.delete_thin(dev_id)?;
            pool.metadata.commit()?;
        }
        AdminCommand::Trim { dev_id, new_size_sectors } => {
            let new_block_count = new_size_sectors.div_ceil(pool.block_size_sectors);
            pool.metadata.trim_thin(dev_id, new_block_count)?;
            pool.metadata.commit()?;
        }
        AdminCommand::SetTransactionId { old, new } => {
            pool.metadata.set_transaction_id(old, new)?;
            pool.metadata.commit()?;
        }
    }
    Ok(String::new())
}
