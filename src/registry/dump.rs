//! Human-readable state dump.

use super::SessionRegistry;
use std::fmt::Write;

impl SessionRegistry {
    /// Renders active, historical and legacy sessions for diagnostics.
    pub fn dump(&self) -> String {
        let tables = self.shared.lock_tables();
        let mut out = String::new();

        let _ = writeln!(out, "Active install sessions:");
        for session in tables.sessions.values() {
            let _ = writeln!(out, "  Session {}:", session.id());
            let _ = writeln!(
                out,
                "    installer={} uid={} user={}",
                session.installer_package(),
                session.installer_uid(),
                session.user_id()
            );
            let _ = writeln!(
                out,
                "    state={} sealed_durably={} active={} progress={:.2}",
                session.state(),
                session.is_sealed_durably(),
                session.is_active(),
                session.progress()
            );
            let _ = writeln!(
                out,
                "    stage={} flags={:#x} created={}",
                session.stage(),
                session.params().install_flags.0,
                session.created_at().to_rfc3339()
            );
            if session.awaiting_user_action() {
                let _ = writeln!(out, "    awaiting user action");
            }
        }

        let _ = writeln!(out, "Historical install sessions:");
        for summary in &tables.historical {
            let _ = writeln!(
                out,
                "  Session {}: installer={} uid={} user={} outcome={} finished={}",
                summary.session_id,
                summary.installer_package,
                summary.installer_uid,
                summary.user_id,
                summary.outcome,
                summary.finished_at.to_rfc3339()
            );
        }

        let _ = writeln!(out, "Legacy install sessions:");
        for id in &tables.legacy {
            let _ = writeln!(out, "  {}", id);
        }
        let _ = writeln!(out, "Allocated session ids: {}", tables.allocated.len());
        out
    }
}
