mod manifest;

pub use manifest::{validated_relative_path, FileDrift, InstallManifest, ManifestFile};

#[cfg(test)]
mod tests;
