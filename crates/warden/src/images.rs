//! Image visibility filtering.
//!
//! Two kinds of images are visible to a tenant: globally sanctioned base
//! images from the configuration, and the tenant's own commit images named
//! `{commit_name}:{tenant}[-suffix]`. Commit images of other tenants are
//! always hidden.

use api_types::ImageConfig;

/// Filters the runtime's raw image list for one requesting tenant.
pub struct ImageFilter<'a> {
    raw_images: Vec<String>,
    image_configs: &'a [ImageConfig],
    commit_name: &'a str,
    commit_image_ports: &'a [u16],
    tenant: Option<&'a str>,
}

impl<'a> ImageFilter<'a> {
    pub fn new(
        raw_images: Vec<String>,
        image_configs: &'a [ImageConfig],
        commit_name: &'a str,
        commit_image_ports: &'a [u16],
        tenant: Option<&'a str>,
    ) -> Self {
        Self {
            raw_images,
            image_configs,
            commit_name,
            commit_image_ports,
            tenant,
        }
    }

    /// True when `candidate` is a commit image owned by the requesting
    /// tenant. Also used for deletion-authorization checks.
    pub fn is_user_image(&self, candidate: &str) -> bool {
        let Some(tenant) = self.tenant else {
            return false;
        };
        candidate == format!("{}:{}", self.commit_name, tenant)
            || candidate.starts_with(&format!("{}:{}-", self.commit_name, tenant))
    }

    /// The image config governing `candidate`, if it is visible. Commit
    /// images synthesize a config carrying the configured commit ports.
    pub fn query_config(&self, candidate: &str) -> Option<ImageConfig> {
        if !self.raw_images.iter().any(|image| image == candidate) {
            return None;
        }

        if self.is_user_image(candidate) {
            return Some(ImageConfig {
                name: candidate.to_string(),
                ports: self.commit_image_ports.to_vec(),
                description: "tenant commit image".to_string(),
            });
        }

        self.image_configs
            .iter()
            .find(|config| {
                config.name == candidate
                    || (!config.name.contains(':')
                        && candidate.starts_with(&format!("{}:", config.name)))
            })
            .cloned()
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.query_config(candidate).is_some()
    }

    /// Visible images, in runtime-supplied order.
    pub fn list(&self) -> Vec<String> {
        self.raw_images
            .iter()
            .filter(|image| self.contains(image))
            .cloned()
            .collect()
    }
}
