use async_trait::async_trait;
use mockall::mock;

use xml_conformance::artifact::ArtifactReference;
use xml_conformance::config::ValidationProfile;
use xml_conformance::document::LineAnnotatedDocument;
use xml_conformance::error::ValidationError;
use xml_conformance::http_client::RemoteFetcher;
use xml_conformance::report::Report;
use xml_conformance::validator::RuleValidation;

mock! {
    pub Fetcher {}

    #[async_trait]
    impl RemoteFetcher for Fetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, ValidationError>;
    }
}

mock! {
    pub Rules {}

    impl RuleValidation for Rules {
        fn validate(
            &self,
            input: &[u8],
            document: &LineAnnotatedDocument,
            artifacts: &[ArtifactReference],
            profile: &ValidationProfile,
        ) -> Report;
    }
}
