//! The static deployment pipeline.
//!
//! Phases are built once from [`RunConfig`] and never change during a run.
//! Every command is argv-style; values come in through `${..}` placeholders.

use crate::config::{PhaseSelection, RunConfig};
use crate::database::{DatabaseTask, SeedFile};
use crate::phase::{Phase, Step, SuccessPredicate};
use crate::runner::CommandTemplate;
use crate::secrets::SecretsTask;
use anyhow::{Context, Result, bail};
use regex::Regex;
use std::path::{Path, PathBuf};

pub const PHASE_IDS: [&str; 6] = [
    "database",
    "secrets",
    "infrastructure",
    "services",
    "api",
    "frontend",
];

/// One-line descriptions for `--list`.
pub fn describe_phase(id: &str) -> &'static str {
    match id {
        "database" => "apply the schema, generate and load seed data, verify tables",
        "secrets" => "generate local secrets and publish them to the secrets manager",
        "infrastructure" => "terraform init, plan and apply; harvest outputs",
        "services" => "build each service and update its function code",
        "api" => "confirm the REST API exists and answers its health check",
        "frontend" => "build the web app, sync it to the bucket, invalidate the CDN",
        _ => "",
    }
}

pub fn default_phases(config: &RunConfig) -> Result<Vec<Phase>> {
    Ok(vec![
        database_phase(config),
        secrets_phase(config)?,
        infrastructure_phase(config),
        services_phase(config),
        api_phase(config)?,
        frontend_phase(config),
    ])
}

fn database_phase(config: &RunConfig) -> Phase {
    let db = &config.database_files;
    let mut phase = Phase::new("database", "Database setup", 1, true)
        .step(Step::database("check connection", DatabaseTask::Ping))
        .step(Step::database(
            "apply schema",
            DatabaseTask::ApplySchema {
                path: PathBuf::from(&db.schema_file),
            },
        ));

    if let Some((program, args)) = db.generator.split_first() {
        let generator = CommandTemplate::new(program.as_str())
            .args(args.iter().map(String::as_str))
            .env("TARGET_SIZE_MB", "${target_size_mb}")
            .env("MYSQL_HOST", "${db.host}")
            .env("MYSQL_PORT", "${db.port}")
            .env("MYSQL_USER", "${db.user}")
            .env("MYSQL_DATABASE", "${db.name}");
        phase = phase.step(Step::command("generate seed data", generator));
    }

    if !db.seed_files.is_empty() {
        let files = db
            .seed_files
            .iter()
            .map(|f| SeedFile {
                table: f.table.clone(),
                path: PathBuf::from(&f.path),
            })
            .collect();
        phase = phase.step(Step::database("load seed data", DatabaseTask::LoadSeeds { files }));
    }

    if !db.verify_tables.is_empty() {
        phase = phase.step(Step::database(
            "verify tables",
            DatabaseTask::VerifyTables {
                tables: db.verify_tables.clone(),
            },
        ));
    }
    phase
}

fn secrets_phase(config: &RunConfig) -> Result<Phase> {
    let aws = "${tool.aws}";
    let mut phase = Phase::new("secrets", "Secrets", 2, true).step(Step::secrets(
        "ensure local secrets",
        SecretsTask {
            names: config.secrets.generated.clone(),
        },
    ));

    if let Some(primary) = config.secrets.generated.first() {
        let value = format!("${{secret.{}}}", primary);
        let already_exists =
            Regex::new("ResourceExistsException").context("Invalid secret existence pattern")?;
        phase = phase
            .step(
                Step::command(
                    "create cloud secret",
                    CommandTemplate::new(aws)
                        .args(["secretsmanager", "create-secret", "--name"])
                        .arg(config.secrets.secret_id.as_str())
                        .arg("--secret-string")
                        .arg(value.as_str())
                        .args(["--region", "${region}"]),
                )
                .expect(SuccessPredicate::ExitZeroOrOutput(already_exists)),
            )
            .step(Step::command(
                "store secret value",
                CommandTemplate::new(aws)
                    .args(["secretsmanager", "put-secret-value", "--secret-id"])
                    .arg(config.secrets.secret_id.as_str())
                    .arg("--secret-string")
                    .arg(value.as_str())
                    .args(["--region", "${region}"]),
            ));
    }
    Ok(phase)
}

fn infrastructure_phase(config: &RunConfig) -> Phase {
    let chdir = format!("-chdir={}", config.infrastructure.dir);
    let terraform = |args: &[&str]| {
        CommandTemplate::new("${tool.terraform}")
            .arg(chdir.as_str())
            .args(args.iter().copied())
    };

    Phase::new("infrastructure", "Infrastructure", 3, true)
        .harvests_outputs()
        .step(Step::command("terraform init", terraform(&["init", "-input=false"])))
        .step(
            Step::command(
                "terraform plan",
                terraform(&[
                    "plan",
                    "-input=false",
                    "-detailed-exitcode",
                    "-out=tfplan",
                    "-var",
                    "environment=${env}",
                    "-var",
                    "aws_region=${region}",
                ]),
            )
            // 2 means "changes present", not an error
            .expect(SuccessPredicate::ExitCodeIn(vec![0, 2])),
        )
        .step(Step::command(
            "terraform apply",
            terraform(&["apply", "-input=false", "-auto-approve", "tfplan"]),
        ))
}

fn services_phase(config: &RunConfig) -> Phase {
    let mut phase = Phase::new("services", "Service deployment", 4, true);
    for service in &config.services {
        if let Some((program, args)) = service.build.split_first() {
            phase = phase.step(Step::command(
                &format!("build {}", service.name),
                CommandTemplate::new(program.as_str())
                    .args(args.iter().map(String::as_str))
                    .cwd(service.dir.as_str()),
            ));
        }
        if let Some(function) = &service.function {
            let artifact = Path::new(&service.dir).join(&service.artifact);
            phase = phase.step(
                Step::command(
                    &format!("deploy {}", service.name),
                    CommandTemplate::new("${tool.aws}")
                        .args(["lambda", "update-function-code", "--function-name"])
                        .arg(function.as_str())
                        .arg("--zip-file")
                        .arg(format!("fileb://{}", artifact.display()))
                        .args(["--region", "${region}"]),
                )
                .best_effort(),
            );
        }
    }
    phase.step(
        Step::command(
            "list deployed functions",
            CommandTemplate::new("${tool.aws}").args([
                "lambda",
                "list-functions",
                "--query",
                "Functions[].FunctionName",
                "--output",
                "text",
                "--region",
                "${region}",
            ]),
        )
        .best_effort(),
    )
}

fn api_phase(config: &RunConfig) -> Result<Phase> {
    let stage = Regex::new(&regex::escape(&config.environment))
        .context("Invalid environment name pattern")?;
    Ok(Phase::new("api", "API verification", 5, false)
        .step(
            Step::command(
                "find REST API",
                CommandTemplate::new("${tool.aws}").args([
                    "apigateway",
                    "get-rest-apis",
                    "--query",
                    "items[].name",
                    "--output",
                    "text",
                    "--region",
                    "${region}",
                ]),
            )
            .expect(SuccessPredicate::StdoutMatches(stage)),
        )
        .step(Step::http(
            "health check",
            "${output.api_gateway_url}/health",
            200,
        )))
}

fn frontend_phase(config: &RunConfig) -> Phase {
    let fe = &config.frontend;
    let build_dir = Path::new(&fe.dir).join(&fe.build_dir);
    Phase::new("frontend", "Frontend publish", 6, false)
        .step(Step::command(
            "install dependencies",
            CommandTemplate::new("${tool.npm}").arg("ci").cwd(fe.dir.as_str()),
        ))
        .step(Step::command(
            "build bundle",
            CommandTemplate::new("${tool.npm}")
                .args(["run", "build"])
                .cwd(fe.dir.as_str())
                .env("VITE_API_URL", "${output.api_gateway_url}"),
        ))
        .step(Step::command(
            "sync to bucket",
            CommandTemplate::new("${tool.aws}")
                .args(["s3", "sync"])
                .arg(build_dir.display().to_string())
                .arg("s3://${output.frontend_bucket}")
                .args(["--delete", "--region", "${region}"]),
        ))
        .step(
            Step::command(
                "invalidate CDN cache",
                CommandTemplate::new("${tool.aws}")
                    .args(["cloudfront", "create-invalidation", "--distribution-id"])
                    .arg("${output.cloudfront_distribution_id}")
                    .args(["--paths", "/*"]),
            )
            .best_effort(),
        )
}

/// Narrow `phases` to the selection, keeping catalog order.
///
/// `only` keeps the listed ids; `from` drops everything before the given id.
/// Both may be combined. An unknown id is an error.
pub fn select_phases(phases: Vec<Phase>, selection: &PhaseSelection) -> Result<Vec<Phase>> {
    let known = |id: &str| phases.iter().any(|p| p.id == id);
    for id in selection.only.iter().chain(selection.from.iter()) {
        if !known(id) {
            bail!(
                "Unknown phase '{}'. Known phases: {}",
                id,
                phases.iter().map(|p| p.id.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
    }

    let start = selection
        .from
        .as_ref()
        .and_then(|from| phases.iter().find(|p| &p.id == from))
        .map(|p| p.ordinal)
        .unwrap_or(0);

    let selected: Vec<Phase> = phases
        .into_iter()
        .filter(|p| p.ordinal >= start)
        .filter(|p| selection.only.is_empty() || selection.only.contains(&p.id))
        .collect();
    if selected.is_empty() {
        bail!("The phase selection is empty");
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliOverrides;
    use crate::phase::{StepAction, validate_phases};
    use crate::rollout_config::RolloutToml;

    fn config() -> RunConfig {
        RunConfig::from_layers(
            PathBuf::from("/srv/shop"),
            RolloutToml::default(),
            &|key: &str| match key {
                "ROLLOUT_ENV" => Some("staging".to_string()),
                "MYSQL_PASSWORD" => Some("pw".to_string()),
                _ => None,
            },
            CliOverrides::default(),
        )
        .unwrap()
    }

    fn ids(phases: &[Phase]) -> Vec<&str> {
        phases.iter().map(|p| p.id.as_str()).collect()
    }

    fn command_of<'a>(phase: &'a Phase, label: &str) -> &'a CommandTemplate {
        match &phase.steps.iter().find(|s| s.label == label).unwrap().action {
            StepAction::Command(t) => t,
            other => panic!("step '{}' is not a command: {:?}", label, other),
        }
    }

    #[test]
    fn test_catalog_is_valid_and_ordered() {
        let phases = default_phases(&config()).unwrap();
        validate_phases(&phases).unwrap();
        assert_eq!(ids(&phases), PHASE_IDS.to_vec());
        let mandatory: Vec<bool> = phases.iter().map(|p| p.mandatory).collect();
        assert_eq!(mandatory, vec![true, true, true, true, false, false]);
        assert!(phases[2].harvest_outputs);
        for id in PHASE_IDS {
            assert!(!describe_phase(id).is_empty());
        }
    }

    #[test]
    fn test_infrastructure_plan_accepts_changes_present() {
        let phases = default_phases(&config()).unwrap();
        let plan = phases[2].steps.iter().find(|s| s.label == "terraform plan").unwrap();
        assert!(matches!(&plan.predicate, SuccessPredicate::ExitCodeIn(codes) if codes == &vec![0, 2]));
        assert_eq!(command_of(&phases[2], "terraform init").args[0], "-chdir=terraform");
    }

    #[test]
    fn test_secret_commands_render_masked() {
        let cfg = config();
        let phases = default_phases(&cfg).unwrap();
        let mut vars = cfg.base_vars();
        vars.insert("secret.jwt_secret".into(), "s3cr3t".into());
        let spec = command_of(&phases[1], "store secret value").render(&vars).unwrap();
        let shown = spec.display();
        assert!(shown.contains("ecommerce-jwt-secret-staging"));
        assert!(shown.contains("****"));
        assert!(!shown.contains("s3cr3t"));
    }

    #[test]
    fn test_services_build_in_their_directory_and_deploy_best_effort() {
        let phases = default_phases(&config()).unwrap();
        let services = &phases[3];
        let build = command_of(services, "build auth-service");
        assert_eq!(build.cwd.as_deref(), Some(Path::new("auth-service")));
        let deploy = services.steps.iter().find(|s| s.label == "deploy auth-service").unwrap();
        assert!(deploy.continue_on_failure);
        let rendered = command_of(services, "deploy auth-service")
            .render(&config().base_vars())
            .unwrap();
        assert!(rendered.args.contains(&"ecommerce-staging-auth".to_string()));
        assert!(rendered.args.contains(&"fileb://auth-service/target/auth-service.jar".to_string()));
    }

    #[test]
    fn test_data_lake_and_ai_functions_are_packaged_and_deployed() {
        let cfg = config();
        let phases = default_phases(&cfg).unwrap();
        let services = &phases[3];
        let mut expected = vec!["raw-to-curated", "curated-to-prod", "data-processing"];
        expected.extend(crate::rollout_config::AI_SYSTEMS);
        for name in expected {
            let build = command_of(services, &format!("build {}", name));
            assert_eq!(build.program, "${tool.python}");
            assert!(build.args.contains(&format!("{}.zip", name)));
            let deploy = services
                .steps
                .iter()
                .find(|s| s.label == format!("deploy {}", name))
                .unwrap();
            assert!(deploy.continue_on_failure);
            let rendered = command_of(services, &format!("deploy {}", name))
                .render(&cfg.base_vars())
                .unwrap();
            assert!(rendered.args.contains(&format!("ecommerce-staging-{}", name)));
        }

        let copilot = command_of(services, "build retail-copilot");
        assert_eq!(copilot.cwd.as_deref(), Some(Path::new("ai-systems/retail-copilot")));
        let raw = command_of(services, "build raw-to-curated");
        assert!(raw.args.contains(&"lambda_function.py".to_string()));
    }

    #[test]
    fn test_frontend_and_api_depend_on_outputs() {
        let phases = default_phases(&config()).unwrap();
        assert!(command_of(&phases[5], "sync to bucket").references_outputs());
        let invalidate = phases[5].steps.iter().find(|s| s.label == "invalidate CDN cache").unwrap();
        assert!(invalidate.continue_on_failure);
        assert!(matches!(&phases[4].steps[1].action, StepAction::Http(c) if c.url.contains("${output.api_gateway_url}")));
    }

    #[test]
    fn test_generator_receives_sizing() {
        let cfg = config();
        let phases = default_phases(&cfg).unwrap();
        let spec = command_of(&phases[0], "generate seed data")
            .render(&cfg.base_vars())
            .unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.env["TARGET_SIZE_MB"], "500");
        assert_eq!(spec.env["MYSQL_DATABASE"], "ecommerce");
    }

    #[test]
    fn test_select_only_keeps_catalog_order() {
        let phases = default_phases(&config()).unwrap();
        let selection = PhaseSelection {
            only: vec!["frontend".into(), "database".into()],
            from: None,
        };
        let selected = select_phases(phases, &selection).unwrap();
        assert_eq!(ids(&selected), vec!["database", "frontend"]);
    }

    #[test]
    fn test_select_from_starts_midway() {
        let phases = default_phases(&config()).unwrap();
        let selection = PhaseSelection {
            only: vec![],
            from: Some("services".into()),
        };
        let selected = select_phases(phases, &selection).unwrap();
        assert_eq!(ids(&selected), vec!["services", "api", "frontend"]);
    }

    #[test]
    fn test_select_unknown_phase_is_an_error() {
        let phases = default_phases(&config()).unwrap();
        let selection = PhaseSelection {
            only: vec!["deploy-everything".into()],
            from: None,
        };
        let err = select_phases(phases, &selection).unwrap_err();
        assert!(err.to_string().contains("Unknown phase 'deploy-everything'"));
    }

    #[test]
    fn test_select_disjoint_only_and_from_is_empty() {
        let phases = default_phases(&config()).unwrap();
        let selection = PhaseSelection {
            only: vec!["database".into()],
            from: Some("api".into()),
        };
        assert!(select_phases(phases, &selection).is_err());
    }
}
