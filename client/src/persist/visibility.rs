//! Which entity fields each written form carries.
//!
//! Secrets (authenticator, code signing key, signatures) live only in the
//! persisted state. Host-local bookkeeping is shown to the local UI but
//! never sent to a project server.

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// The audience of a written entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteContext {
    State,
    Server,
    Gui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visibility {
    pub state: bool,
    pub server: bool,
    pub gui: bool,
}

impl Visibility {
    pub const ALL: Visibility = Visibility {
        state: true,
        server: true,
        gui: true,
    };
    pub const STATE_ONLY: Visibility = Visibility {
        state: true,
        server: false,
        gui: false,
    };
    pub const LOCAL: Visibility = Visibility {
        state: true,
        server: false,
        gui: true,
    };

    pub fn allows(&self, ctx: WriteContext) -> bool {
        match ctx {
            WriteContext::State => self.state,
            WriteContext::Server => self.server,
            WriteContext::Gui => self.gui,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    App,
    AppVersion,
    Workunit,
    Result,
    FileInfo,
}

pub fn field_visibility(kind: EntityKind, field: &str) -> Visibility {
    match (kind, field) {
        (EntityKind::Project, "authenticator" | "code_sign_key") => Visibility::STATE_ONLY,
        (
            EntityKind::Project,
            "debt"
            | "min_rpc_time"
            | "nrpc_failures"
            | "master_fetch_failures"
            | "exp_avg_cpu"
            | "exp_avg_mod_time"
            | "master_url_fetch_pending"
            | "sched_rpc_pending"
            | "tentative"
            | "send_file_list"
            | "suspended_via_gui"
            | "non_cpu_intensive",
        ) => Visibility::LOCAL,
        (EntityKind::FileInfo, "signed_xml" | "xml_signature" | "file_signature") => {
            Visibility::STATE_ONLY
        }
        (
            EntityKind::FileInfo,
            "start_url" | "current_url" | "error_msg" | "upload_offset" | "download_offset",
        ) => Visibility::LOCAL,
        _ => Visibility::ALL,
    }
}

/// Serializes an entity, keeping only the fields visible in `ctx`.
pub fn to_value<T: Serialize>(kind: EntityKind, entity: &T, ctx: WriteContext) -> Result<Value> {
    let mut value = serde_json::to_value(entity)?;
    if let Value::Object(map) = &mut value {
        map.retain(|field, _| field_visibility(kind, field).allows(ctx));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::file_info::FileInfo;
    use crate::state::project::Project;

    #[test]
    fn authenticator_stays_local() {
        let mut p = Project::new("http://p/", "secret");
        p.debt = 5.;
        let state = to_value(EntityKind::Project, &p, WriteContext::State).unwrap();
        let server = to_value(EntityKind::Project, &p, WriteContext::Server).unwrap();
        let gui = to_value(EntityKind::Project, &p, WriteContext::Gui).unwrap();
        assert_eq!(state["authenticator"], "secret");
        assert!(server.get("authenticator").is_none());
        assert!(gui.get("authenticator").is_none());
        assert!(server.get("debt").is_none());
        assert_eq!(gui["debt"], 5.);
        assert_eq!(server["master_url"], "http://p/");
    }

    #[test]
    fn signatures_only_in_state() {
        let mut f = FileInfo::new("f");
        f.xml_signature = "sig".to_string();
        let gui = to_value(EntityKind::FileInfo, &f, WriteContext::Gui).unwrap();
        assert!(gui.get("xml_signature").is_none());
        assert_eq!(gui["name"], "f");
        let state = to_value(EntityKind::FileInfo, &f, WriteContext::State).unwrap();
        assert_eq!(state["xml_signature"], "sig");
    }
}
