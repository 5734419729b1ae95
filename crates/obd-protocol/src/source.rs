//! Reading Sources
//!
//! [`PidSource`] is what the acquisition loop and the heartbeat talk to.
//! Implementors only provide the raw command exchange; PID queries, VIN,
//! DTC and discovery are decoded the same way for a real adapter and for
//! the emulator.

use crate::client::ConnectionState;
use crate::decoder;
use crate::dtc::{self, DtcRecord, MilStatus};
use crate::error::{DecodeError, ObdError};
use crate::mode;
use crate::pid::{PidCode, PidRegistry, Reading};
use crate::protocol::ObdProtocol;
use async_trait::async_trait;
use metrics::counter;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Highest bitmap PID walked during discovery (`01C0`)
const LAST_BITMAP_BASE: u8 = 0xC0;

#[async_trait]
pub trait PidSource: Send + Sync {
    /// Definitions used to decode responses
    fn registry(&self) -> &PidRegistry;

    /// Send one command and return the cleaned response lines
    async fn exchange(&self, command: &str) -> Result<Vec<String>, ObdError>;

    fn state(&self) -> ConnectionState;

    /// Liveness check; fails when the link or the ECU is gone
    async fn probe(&self) -> Result<(), ObdError>;

    /// Tear down and repeat the full handshake
    async fn reconnect(&self) -> Result<(), ObdError>;

    /// Report that every polled PID keeps failing
    fn mark_degraded(&self) {}

    /// Bus protocol in use; `Auto` when unknown
    fn active_protocol(&self) -> ObdProtocol {
        ObdProtocol::Auto
    }

    /// Query and decode one PID
    async fn query(&self, code: PidCode) -> Result<Reading, ObdError> {
        let definition = self
            .registry()
            .get(&code)
            .ok_or_else(|| DecodeError::UnknownPid(code.to_string()))?;

        counter!("obd_queries_total").increment(1);
        let lines = self.exchange(&code.command()).await?;

        decoder::decode(definition, &lines.join(" ")).map_err(|e| {
            counter!("obd_decode_failures_total").increment(1);
            debug!("PID {} decode failed: {}", code, e);
            ObdError::Decode(e)
        })
    }

    /// Read the VIN with mode 09 PID 02
    async fn read_vin(&self) -> Result<String, ObdError> {
        let code = PidCode::new(mode::VEHICLE_INFO, 0x02);
        let lines = self.exchange(&code.command()).await?;
        Ok(decoder::decode_vin_response(&lines)?)
    }

    /// MIL lamp and stored-code count from `0101`
    async fn read_mil_status(&self) -> Result<MilStatus, ObdError> {
        let code = PidCode::current(0x01);
        let lines = self.exchange(&code.command()).await?;
        let bytes = decoder::extract_payload(code, 4, &lines.join(" "))?;
        Ok(dtc::decode_mil_status(bytes[0]))
    }

    /// Stored trouble codes (mode 03), tagged with the current MIL state
    async fn read_dtcs(&self) -> Result<Vec<DtcRecord>, ObdError> {
        let mil_active = match self.read_mil_status().await {
            Ok(status) => status.mil_active,
            Err(e) if e.is_link_failure() => return Err(e),
            Err(e) => {
                warn!("MIL status unavailable, assuming lamp off: {}", e);
                false
            }
        };

        let lines = self.exchange(&format!("{:02X}", mode::READ_DTC)).await?;
        Ok(decoder::decode_dtc_response(&lines, mil_active)?)
    }

    /// Walk the `0100`, `0120`, ... bitmaps while each announces the next
    async fn discover_supported(&self) -> Result<BTreeSet<PidCode>, ObdError> {
        let mut supported = BTreeSet::new();
        let mut base = 0x00u8;

        loop {
            let code = PidCode::current(base);
            let lines = self.exchange(&code.command()).await?;
            let bitmap = match decoder::extract_payload(code, 4, &lines.join(" ")) {
                Ok(bitmap) => bitmap,
                // the previous bitmap over-announced
                Err(DecodeError::NoData) if base > 0 => break,
                Err(e) => return Err(e.into()),
            };

            let (pids, next) = decoder::decode_supported_bitmap(base, &bitmap);
            debug!("Bitmap {} announces {} PIDs", code, pids.len());
            supported.extend(pids);

            if !next || base >= LAST_BITMAP_BASE {
                break;
            }
            base += 0x20;
        }

        Ok(supported)
    }
}
