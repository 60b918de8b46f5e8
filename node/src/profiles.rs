//! Identity profiles of the ERP models a POS node syncs.

use possync_engine::{ModelProfile, ProfileRegistry};

/// Profiles for the models shipped with the POS.
pub fn default_profiles() -> ProfileRegistry {
    ProfileRegistry::new()
        .with(
            ModelProfile::new("product.category")
                .natural_key(&["complete_name"])
                .natural_key(&["name", "parent_id"])
                .discriminator("name"),
        )
        .with(
            ModelProfile::new("product.product")
                .natural_key(&["barcode"])
                .natural_key(&["default_code"])
                .natural_key(&["name", "type"])
                .discriminator("name")
                .discriminator("barcode")
                .depends_on("product.category"),
        )
        .with(
            ModelProfile::new("res.partner")
                .natural_key(&["vat"])
                .natural_key(&["ref"])
                .discriminator("name"),
        )
        .with(
            ModelProfile::new("institution")
                .natural_key(&["code"])
                .natural_key(&["name", "type"])
                .discriminator("name")
                .depends_on("res.partner"),
        )
        .with(
            ModelProfile::new("institution.client")
                .natural_key(&["institution_id", "partner_id"])
                .depends_on("institution")
                .depends_on("res.partner"),
        )
        .with(
            ModelProfile::new("loyalty.program")
                .natural_key(&["name", "program_type"])
                .discriminator("name")
                .depends_on("product.product"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_engine::MigrationManifest;

    #[test]
    fn parents_are_planned_first() {
        let counts = [
            "loyalty.program",
            "institution.client",
            "institution",
            "res.partner",
            "product.product",
            "product.category",
        ]
        .iter()
        .map(|m| (m.to_string(), 1))
        .collect();
        let manifest = MigrationManifest::new(counts, vec![]);

        let plan = manifest.plan(&default_profiles(), &[]).unwrap();
        let position = |model: &str| plan.iter().position(|m| m == model).unwrap();

        assert!(position("product.category") < position("product.product"));
        assert!(position("product.product") < position("loyalty.program"));
        assert!(position("res.partner") < position("institution"));
        assert!(position("institution") < position("institution.client"));
    }
}
