// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sym53c8xx_rs::{
    cfg::{
        cli::{parse_args, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    client::HostAdapter,
    control_block::{
        inquiry::{INQUIRY, fill_inquiry_standard, parse_inquiry_summary},
        read_write::build_read10,
        test_unit_ready::build_test_unit_ready,
    },
    dma::{DmaError, DmaPool},
    hba::{CommandRequest, DataDirection, DataSegment, Hba, dma_pool},
    hw::LoopbackController,
};
use tokio::{main, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const BLOCK: u32 = 512;
const READ10: u8 = 0x28;

/// Answers every fetched CCB the way a healthy disk would.
fn serve(ctrl: &mut LoopbackController) -> Result<usize, DmaError> {
    let fetched = ctrl.fetch_all();
    for &ba in &fetched {
        let hdr = ctrl.header(ba)?;
        match hdr.cdb[0] {
            INQUIRY => {
                let mut data = [0u8; 36];
                data[2] = 0x05;
                data[4] = 31;
                data[7] = 0x32;
                data[8..16].copy_from_slice(b"LOOPBACK");
                data[16..32].copy_from_slice(b"SYM53C8XX DISK  ");
                ctrl.write_data_in(ba, &data)?;
            },
            READ10 => {
                let blocks = u16::from_be_bytes([hdr.cdb[7], hdr.cdb[8]]);
                let data: Vec<u8> = (0..u32::from(blocks) * BLOCK).map(|i| i as u8).collect();
                ctrl.write_data_in(ba, &data)?;
            },
            _ => {},
        }
        ctrl.complete(ba, 0)?;
    }
    Ok(fetched.len())
}

fn spawn_target(adapter: Arc<HostAdapter<LoopbackController>>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(Duration::from_millis(1)) => {},
            }
            let served = adapter.with_hba(|hba| serve(hba.controller_mut())).await;
            match served {
                Ok(0) => {},
                Ok(_) => {
                    adapter.on_interrupt().await;
                },
                Err(e) => error!(error = %e, "loopback target failed"),
            }
        }
    })
}

async fn exercise(
    adapter: &HostAdapter<LoopbackController>,
    pool: &DmaPool,
    target: u8,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cdb = [0u8; 16];

    let n = build_test_unit_ready(&mut cdb, 0);
    let r = adapter.execute(CommandRequest::new(target, 0, &cdb[..n]), cancel).await?;
    info!(target, transport = ?r.transport, status = ?r.scsi_status, "TEST UNIT READY");

    let buf = pool.allocate(4 * BLOCK as usize)?;
    let seg = |len: u32| vec![DataSegment { addr: buf.bus, len }];

    let n = fill_inquiry_standard(&mut cdb, 36);
    let req = CommandRequest::new(target, 0, &cdb[..n]).with_data(DataDirection::In, seg(36));
    let r = adapter.execute(req, cancel).await?;
    let mut data = [0u8; 36];
    pool.read(buf.bus, &mut data)?;
    let inq = parse_inquiry_summary(&data)?;
    info!(target, good = r.is_good(), vendor = %inq.vendor, product = %inq.product, "INQUIRY");

    let n = build_read10(&mut cdb, 0, 4, 0);
    let req = CommandRequest::new(target, 0, &cdb[..n]).with_data(DataDirection::In, seg(4 * BLOCK));
    let r = adapter.execute(req, cancel).await?;
    let mut head = [0u8; 16];
    pool.read(buf.bus, &mut head)?;
    info!(target, good = r.is_good(), residual = r.residual, head = %hex::encode(head), "READ(10)");

    pool.free(buf)?;
    Ok(())
}

#[main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let _init_logger = init_logger(&args.logger.to_string_lossy())?;

    let config = resolve_config_path(&args.config)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let pool = dma_pool(&config.controller);
    let ctrl = LoopbackController::new(Arc::clone(&pool));
    let hba = Hba::attach(&config, ctrl, Arc::clone(&pool)).context("attach failed")?;
    info!(adapter = %hba.name(), "adapter attached");

    let adapter = HostAdapter::new(hba, config.runtime.clone());
    let cancel = CancellationToken::new();
    let target_task = spawn_target(Arc::clone(&adapter), cancel.clone());

    let mut outcome = Ok(());
    for &target in &args.targets {
        if let Err(e) = exercise(&adapter, &pool, target, &cancel).await {
            error!(target, error = %e, "target exercise failed");
            outcome = Err(e);
            break;
        }
    }

    cancel.cancel();
    target_task.await?;
    let stats = adapter.with_hba(|hba| hba.stats()).await;
    info!(?stats, "done");
    adapter.shutdown().await?;
    outcome
}
