//! Push-Notification-Kollaborateur
//!
//! Wird fire-and-forget gerufen, wenn eine Anruf-Einladung einen
//! Endpoint ohne Live-Verbindung erreicht. Die eigentliche Zustellung
//! (APNs, FCM, ...) liegt außerhalb dieses Crates.

use crate::call::CallKind;
use async_trait::async_trait;

/// Weckt einen Endpoint ohne Live-Verbindung
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify_incoming_call(&self, to: &str, caller_name: &str, kind: CallKind);
}

/// Standard-Implementierung: loggt den Weckversuch nur
#[derive(Debug, Default)]
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn notify_incoming_call(&self, to: &str, caller_name: &str, kind: CallKind) {
        tracing::info!(
            "Push notification: {:?} call for offline endpoint {} from {}",
            kind,
            to,
            caller_name
        );
    }
}
