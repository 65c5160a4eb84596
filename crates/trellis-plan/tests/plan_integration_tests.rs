use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;

use trellis_model::{ConfigValue, InterfaceRegistry, SchemaRegistry, Store};
use trellis_plan::{
    apply, issue_codes, ConfigExporter, Context, OutputTarget, PlanError, PlanResult, Planner,
    RuntimeFacts, TemplateEngine,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A blog stack: a mysql server consumed by a ghost instance over the
/// mysql-database interface, with a production environment supplying the
/// one value that has no default.
const BLOG_MODEL: &str = r#"
kind: Interface
name: mysql-database
version: "5.7"
roles:
  server:
    cardinality: one
    provides:
      - name: host
        default: localhost
      - name: port
        default: 3306
      - name: database
        default: app
      - name: admin_user
        default: root
      - name: admin_password
        secret: true
  client:
    uses: [host, port, database, admin_user, admin_password]
---
kind: Component
name: mysql
version: "5.7"
image: mysql:5.7
config:
  datadir: /var/lib/mysql
environment:
  - name: MYSQL_ROOT_PASSWORD
    value: "{db.admin_password}"
  - name: MYSQL_DATABASE
    value: "{db.database}"
endpoints:
  - name: db
    interface: mysql-database
    role: server
    addresses:
      - ports:
          - port: 3306
---
kind: Component
name: ghost
image: ghost:3
config:
  url: "http://{public_dns}/"
  database_url: "mysql://{db_local.uses.admin_user}:{db_local.uses.admin_password}@{db_remote.service}:{db_local.uses.port}/{db_local.uses.database}"
environment:
  - name: url
    value: "{url}"
  - name: database_url
    value: "{database_url}"
  - name: database__connection__user
endpoints:
  - name: db
    interface: mysql-database
    role: client
---
kind: Graph
name: blog
version: 1
services:
  - name: db
    component: mysql
  - name: blog
    component: ghost
    config:
      public_dns: blog.local
relations:
  - [db:db, blog:db]
---
kind: Environment
name: production
config:
  services:
    blog:
      public_dns: blog.example.com
      environment:
        - name: database__connection__user
          value: "{db_remote.provided.admin_user}"
    db:
      db:
        admin_password: s3cret-pw
"#;

fn load_model(source: &str) -> (Store, InterfaceRegistry) {
    let mut store = Store::new();
    store
        .add_documents("model.yaml", source)
        .expect("model should parse");
    store
        .validate(&SchemaRegistry::default())
        .expect("model should validate");
    let interfaces = InterfaceRegistry::from_store(&store).expect("interfaces decode");
    (store, interfaces)
}

fn plan_blog(environment: Option<&str>) -> Result<PlanResult, PlanError> {
    let (store, interfaces) = load_model(BLOG_MODEL);
    let planner = Planner::new(&store, &interfaces);
    planner.plan_named("blog", None, environment, &RuntimeFacts::new())
}

#[test]
fn test_blog_stack_plans_end_to_end() {
    init_tracing();
    let plan = plan_blog(Some("production")).expect("plan should succeed");

    assert_eq!(plan.environment.as_deref(), Some("production"));
    assert_eq!(plan.relations.len(), 1);
    assert_eq!(plan.relations[0].name, "db:db=blog:db");
    assert_eq!(plan.contexts.len(), 2);

    // The server publishes its coordinates: explicit override for the
    // password, interface defaults for everything else.
    let server = &plan.relations[0].endpoints[0];
    assert_eq!(server.qual_name(), "db:db");
    assert_eq!(server.provided.get("port"), Some(&ConfigValue::Integer(3306)));
    assert_eq!(
        server.provided.get("admin_password"),
        Some(&ConfigValue::from("s3cret-pw").into_secret())
    );

    let db = plan.context("db").expect("db context");
    // The server's own endpoint view carries the published values, so its
    // environment entries can reference them.
    assert_eq!(
        db.get("db.admin_user"),
        Some(&ConfigValue::from("root"))
    );
    let root_password = db.env_value("MYSQL_ROOT_PASSWORD").expect("assigned");
    assert!(root_password.is_secret(), "password must stay marked");
    assert_eq!(root_password.reveal(), &ConfigValue::from("s3cret-pw"));
    assert_eq!(db.env_value("MYSQL_DATABASE"), Some(&ConfigValue::from("app")));

    let blog = plan.context("blog").expect("blog context");
    // Environment configuration beats the graph's service spec.
    assert_eq!(blog.get("url"), Some(&ConfigValue::from("http://blog.example.com/")));
    // The client's expression pulls peer values through its views; touching
    // the secret taints the whole rendered string.
    let dsn = blog.get("database_url").expect("database_url");
    assert!(dsn.is_secret(), "database_url embeds a secret");
    assert_eq!(
        dsn.reveal(),
        &ConfigValue::from("mysql://root:s3cret-pw@db:3306/app")
    );
    assert_eq!(
        blog.get("db_remote.provided.host"),
        Some(&ConfigValue::from("localhost"))
    );
    assert_eq!(
        blog.get("db_remote.by_name.db.role"),
        Some(&ConfigValue::from("server"))
    );
    // The bare requirement from the component is satisfied by the
    // environment through a remote-view expression.
    assert_eq!(
        blog.env_value("database__connection__user"),
        Some(&ConfigValue::from("root"))
    );
}

#[test]
fn test_planning_is_deterministic() {
    init_tracing();
    let first = plan_blog(Some("production")).expect("first plan");
    let second = plan_blog(Some("production")).expect("second plan");
    assert_eq!(first, second);

    let first_json = serde_json::to_string(&first).expect("serializes");
    let second_json = serde_json::to_string(&second).expect("serializes");
    assert_eq!(first_json, second_json, "serialized plans must be identical");
}

#[test]
fn test_missing_secret_without_environment_fails() {
    init_tracing();
    // Without the production environment nothing assigns admin_password,
    // which has no default.
    let error = plan_blog(None).expect_err("plan must fail");
    assert!(
        error.has_code(issue_codes::RELATION_UNSATISFIED),
        "got: {}",
        error
    );
    assert!(error.to_string().contains("admin_password"), "got: {}", error);
}

#[test]
fn test_embedded_graph_promotes_endpoint_with_configuration() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Interface
name: sql-store
roles:
  server:
    provides:
      - name: port
        default: 5432
      - name: admin_user
        default: postgres
  client:
    uses: [port, admin_user]
---
kind: Component
name: postgres
image: postgres:15
config:
  shared_buffers: 128MB
endpoints:
  - name: sql
    interface: sql-store
    role: server
---
kind: Graph
name: storage
services:
  - name: primary
    component: postgres
    config:
      admin_user: stack-admin
expose:
  - name: sql
    target: primary:sql
---
kind: Component
name: api
image: api:1
endpoints:
  - name: db
    interface: sql-store
    role: client
---
kind: Graph
name: stack
services:
  - name: data
    component: storage
  - name: api
relations:
  - [data:sql, api:db]
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let plan = planner
        .plan_named("stack", None, None, &RuntimeFacts::new())
        .expect("plan should succeed");

    let data = plan.graph.service("data").expect("data service");
    assert!(data.embedded, "graph-backed service is embedded");
    assert_eq!(data.component, "storage");
    assert_eq!(data.endpoints.len(), 1);
    assert_eq!(data.endpoints[0].name, "sql");

    // The inner service's configuration travels with the promoted endpoint
    // and feeds the provided snapshot.
    let server = &plan.relations[0].endpoints[0];
    assert_eq!(
        server.provided.get("admin_user"),
        Some(&ConfigValue::from("stack-admin"))
    );
    assert_eq!(server.provided.get("port"), Some(&ConfigValue::Integer(5432)));

    let api = plan.context("api").expect("api context");
    assert_eq!(
        api.get("db_local.uses.admin_user"),
        Some(&ConfigValue::from("stack-admin"))
    );
}

#[test]
fn test_mutually_embedded_graphs_are_rejected() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Graph
name: loop-a
services:
  - name: data
    component: loop-b
---
kind: Graph
name: loop-b
services:
  - name: inner
    component: loop-a
expose:
  - name: sql
    target: inner:sql
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let error = planner
        .plan_named("loop-a", None, None, &RuntimeFacts::new())
        .expect_err("embedding cycle must fail");
    assert!(error.has_code(issue_codes::CYCLIC_REFERENCE), "got: {}", error);
    assert!(
        error.to_string().contains("loop-a -> loop-b -> loop-a"),
        "got: {}",
        error
    );
}

#[test]
fn test_every_issue_is_collected_before_failing() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Graph
name: broken
services:
  - name: one
    component: nowhere
  - name: two
    component: also-nowhere
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let error = planner
        .plan_named("broken", None, None, &RuntimeFacts::new())
        .expect_err("plan must fail");
    let issues = error.issues();
    assert_eq!(issues.len(), 2, "got: {}", error);
    assert!(issues
        .iter()
        .all(|issue| issue.code == issue_codes::COMPONENT_RESOLUTION));
}

#[test]
fn test_expression_cycle_fails_the_plan() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Component
name: app
image: app
config:
  a: "{b}"
  b: "{a}"
---
kind: Graph
name: g
services:
  - name: app
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let error = planner
        .plan_named("g", None, None, &RuntimeFacts::new())
        .expect_err("plan must fail");
    assert!(error.has_code(issue_codes::CYCLIC_REFERENCE), "got: {}", error);
}

#[test]
fn test_runtime_facts_override_everything() {
    init_tracing();
    let (store, interfaces) = load_model(BLOG_MODEL);
    let mut facts = RuntimeFacts::new();
    facts.set_service("blog", "public_dns", json!("edge.example.net"));
    let planner = Planner::new(&store, &interfaces);
    let plan = planner
        .plan_named("blog", None, Some("production"), &facts)
        .expect("plan should succeed");
    assert_eq!(
        plan.context("blog").and_then(|c| c.get("url")),
        Some(&ConfigValue::from("http://edge.example.net/"))
    );
}

#[test]
fn test_escaped_braces_render_literally() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Component
name: app
image: app
config:
  pattern: "{{count}} items"
---
kind: Graph
name: g
services:
  - name: app
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let plan = planner
        .plan_named("g", None, None, &RuntimeFacts::new())
        .expect("plan should succeed");
    assert_eq!(
        plan.context("app").and_then(|c| c.get("pattern")),
        Some(&ConfigValue::from("{count} items"))
    );
}

#[test]
fn test_expired_deadline_aborts_planning() {
    init_tracing();
    let (store, interfaces) = load_model(BLOG_MODEL);
    let planner = Planner::new(&store, &interfaces)
        .with_deadline(Instant::now() - Duration::from_millis(1));
    let error = planner
        .plan_named("blog", None, Some("production"), &RuntimeFacts::new())
        .expect_err("expired deadline must abort");
    assert!(matches!(error, PlanError::Timeout), "got: {}", error);
}

#[test]
fn test_unknown_graph_is_a_model_error() {
    init_tracing();
    let (store, interfaces) = load_model(BLOG_MODEL);
    let planner = Planner::new(&store, &interfaces);
    let error = planner
        .plan_named("missing", None, None, &RuntimeFacts::new())
        .expect_err("unknown graph must fail");
    assert!(matches!(error, PlanError::Model(_)), "got: {}", error);
}

#[test]
fn test_apply_exports_configs_and_secrets() {
    init_tracing();
    let plan = plan_blog(Some("production")).expect("plan should succeed");
    let dir = tempfile::tempdir().expect("tempdir");

    let rendering = apply(
        &plan,
        &ConfigExporter::new(),
        &OutputTarget::Directory(dir.path().to_path_buf()),
    )
    .expect("apply should succeed");
    assert!(rendering.get("configs/blog-db-config.json").is_some());
    assert!(rendering.get("blog-relations.yaml").is_some());

    let db_config =
        std::fs::read_to_string(dir.path().join("configs/blog-db-config.json")).expect("config");
    assert!(db_config.contains("\"component\": \"mysql\""), "got: {}", db_config);
    assert!(
        db_config.contains("<secret>"),
        "secrets must be redacted in the config document"
    );
    assert!(
        !db_config.contains("s3cret-pw"),
        "config document must not leak the revealed secret"
    );

    let db_secrets =
        std::fs::read_to_string(dir.path().join("configs/blog-db-secrets.json")).expect("secrets");
    assert!(db_secrets.contains("s3cret-pw"), "got: {}", db_secrets);

    let relations =
        std::fs::read_to_string(dir.path().join("blog-relations.yaml")).expect("relations");
    assert!(relations.contains("db:db=blog:db"), "got: {}", relations);
}

struct KeyValueEngine;

impl TemplateEngine for KeyValueEngine {
    fn render(&self, template: &str, context: &Context) -> Result<String, PlanError> {
        // A stand-in engine: renders the datadir of the service it runs for.
        let datadir = context
            .get("datadir")
            .and_then(|value| value.as_str())
            .unwrap_or_default();
        Ok(format!("# {}\ndatadir={}\n", template, datadir))
    }
}

#[test]
fn test_apply_renders_file_templates_through_the_engine() {
    init_tracing();
    let (store, interfaces) = load_model(
        r#"
kind: Component
name: mysql
image: mysql:5.7
config:
  datadir: /var/lib/mysql
files:
  - template: file://conf/my.cnf.tmpl
    container_path: /etc/mysql/my.cnf
---
kind: Graph
name: solo
services:
  - name: db
    component: mysql
"#,
    );
    let planner = Planner::new(&store, &interfaces);
    let plan = planner
        .plan_named("solo", None, None, &RuntimeFacts::new())
        .expect("plan should succeed");

    let rendering = apply(
        &plan,
        &ConfigExporter::with_engine(Box::new(KeyValueEngine)),
        &OutputTarget::Memory,
    )
    .expect("apply should succeed");

    let doc = rendering
        .get("resources/solo-db-my-cnf-tmpl")
        .expect("rendered template present");
    let body = doc.data.as_str().expect("raw document");
    assert!(body.contains("datadir=/var/lib/mysql"), "got: {}", body);
    assert_eq!(
        doc.annotations.get("container_path").map(String::as_str),
        Some("/etc/mysql/my.cnf")
    );
}
