// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Safewatch: citizen-safety reporting core.
//
// Entry point. Initialises logging and backend services, then runs the
// periodic one-time-code sweep until interrupted.

mod services;

use std::sync::Arc;

use services::app_services::AppServices;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Safewatch starting");

    let services = match AppServices::init() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(error = %e, "backend services failed to initialise");
            std::process::exit(1);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweep_expired_otps(Arc::clone(&services), stop_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");

    // The sweeper finishes any sweep already running before it returns.
    let _ = stop_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "code sweeper ended abnormally");
    }

    match Arc::try_unwrap(services) {
        Ok(services) => {
            if let Err(e) = services.shutdown() {
                tracing::error!(error = %e, "unclean shutdown");
            }
        }
        Err(_) => tracing::warn!("services still in use at shutdown"),
    }
}

/// Purge expired one-time codes on the configured interval until `stop`
/// flips to true or its sender is dropped.
async fn sweep_expired_otps(services: Arc<AppServices>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(services.config().otp_sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        let svc = Arc::clone(&services);
        match tokio::task::spawn_blocking(move || svc.sweep_expired_otps()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => tracing::debug!(removed, "expired codes swept"),
            Ok(Err(e)) => tracing::warn!(error = %e, "code sweep failed"),
            Err(e) => tracing::warn!(error = %e, "code sweep task panicked"),
        }
    }
}
