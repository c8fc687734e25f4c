//! Evidence client tests against a mocked eutils endpoint.

use std::sync::Arc;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use evidence_harness::config::{EvidenceConfig, SecurityConfig};
use evidence_harness::evidence::{EvidenceClient, EvidenceQuery};
use evidence_harness::guard::SecurityGuard;
use evidence_harness::store::{EvidenceCache, MemoryStore};

const ID_LIST_XML: &str = r#"<?xml version="1.0"?>
<eSearchResult>
  <Count>2</Count>
  <IdList>
    <Id>31000002</Id>
    <Id>32000001</Id>
  </IdList>
</eSearchResult>"#;

const ARTICLE_SET_XML: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">31000002</PMID>
      <Article>
        <Journal>
          <Title>Critical Care</Title>
          <JournalIssue><PubDate><Year>2015</Year></PubDate></JournalIssue>
        </Journal>
        <ArticleTitle>Fluid resuscitation strategies in septic shock</ArticleTitle>
        <Abstract>
          <AbstractText>Bolus timing in adult septic shock.</AbstractText>
        </Abstract>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">32000001</PMID>
      <Article>
        <Journal>
          <Title>Pediatrics</Title>
          <JournalIssue><PubDate><Year>2024</Year></PubDate></JournalIssue>
        </Journal>
        <ArticleTitle>Epinephrine timing in pediatric anaphylaxis</ArticleTitle>
        <Abstract>
          <AbstractText>Early epinephrine improves anaphylaxis outcomes.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Rivera</LastName><ForeName>Ana</ForeName></Author>
        </AuthorList>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

fn client_for(server: &MockServer, enabled: bool) -> (EvidenceClient, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let guard = Arc::new(SecurityGuard::new(&SecurityConfig::default()));
    let config = EvidenceConfig {
        enabled,
        base_url: server.uri(),
        default_limit: 3,
        max_ids: 20,
    };
    let client = EvidenceClient::new(store.clone(), guard, config).unwrap();
    (client, store)
}

fn query() -> EvidenceQuery {
    EvidenceQuery {
        intervention: "epinephrine".to_string(),
        case_type: "anaphylaxis".to_string(),
        age_group: None,
        limit: 3,
    }
}

#[tokio::test]
async fn test_search_fetches_ranks_and_then_serves_from_cache() {
    let server = MockServer::start().await;

    // expect(1) on both mocks: the second search must not reach the network
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .and(query_param("db", "pubmed"))
        .and(query_param("term", "epinephrine anaphylaxis pediatric emergency"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ID_LIST_XML))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .and(query_param("id", "31000002,32000001"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_SET_XML))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = client_for(&server, true);

    let first = client.search("learner-1", &query()).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].external_id, "32000001");
    assert!(first[0].relevance > first[1].relevance);
    assert_eq!(first[0].authors, vec!["Ana Rivera"]);

    // Fetched articles were persisted under the normalized key
    let cached = store
        .cached_articles("epinephrine anaphylaxis pediatric emergency")
        .await
        .unwrap();
    assert_eq!(cached.len(), 2);

    let second = client.search("learner-1", &query()).await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].external_id, first[0].external_id);
}

#[tokio::test]
async fn test_upstream_failure_degrades_to_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server, true);
    let articles = client.search("learner-1", &query()).await.unwrap();
    assert!(articles.is_empty());
}

#[tokio::test]
async fn test_empty_id_list_skips_the_detail_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<?xml version="1.0"?><eSearchResult><Count>0</Count><IdList/></eSearchResult>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (client, _) = client_for(&server, true);
    let articles = client.search("learner-1", &query()).await.unwrap();
    assert!(articles.is_empty());
}

#[tokio::test]
async fn test_disabled_client_never_calls_the_network() {
    let server = MockServer::start().await;

    let (client, _) = client_for(&server, false);
    let articles = client.search("learner-1", &query()).await.unwrap();
    assert!(articles.is_empty());

    assert!(server
        .received_requests()
        .await
        .map(|reqs| reqs.is_empty())
        .unwrap_or(true));
}
