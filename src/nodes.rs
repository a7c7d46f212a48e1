use serde::Serialize;

/// Registration record for a UI-only node. The graph host reads these when
/// the plugin loads; the nodes take no graph inputs and produce no outputs,
/// all real work happens through the HTTP routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeRegistration {
    pub id: &'static str,
    pub display_name: &'static str,
    pub category: &'static str,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
}

const NODES: &[NodeRegistration] = &[
    NodeRegistration {
        id: "UrlDownloader",
        display_name: "URL Downloader",
        category: "dlserve",
        inputs: &[],
        outputs: &[],
    },
    NodeRegistration {
        id: "HubListDownloader",
        display_name: "Hub List Downloader",
        category: "dlserve",
        inputs: &[],
        outputs: &[],
    },
    NodeRegistration {
        id: "PathUploader",
        display_name: "Upload To Path",
        category: "dlserve",
        inputs: &[],
        outputs: &[],
    },
];

pub fn registrations() -> &'static [NodeRegistration] {
    NODES
}
