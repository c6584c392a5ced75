//! The fetcher plugin family contract. Plugin code itself is a separate
//! collaborator with a narrow interface; the registry only needs to know
//! whether a `pluginId` names a recognized family, and never loads or
//! runs plugin code itself.

/// Recognized fetcher plugin families. New fetcher types are added here as
/// the plugin surface grows; this is deliberately a static allow-list
/// rather than a dynamic registry, since plugin loading itself is out of
/// scope for the pipeline core.
const KNOWN_PLUGIN_FAMILIES: &[&str] = &[
    "FileSystemFetcher",
    "HttpFetcher",
    "S3Fetcher",
    "AzBlobFetcher",
    "GcsFetcher",
];

pub fn is_known_plugin_family(plugin_id: &str) -> bool {
    KNOWN_PLUGIN_FAMILIES.contains(&plugin_id)
}
