//! CLI command implementations.
//!
//! | Module | Flags handled                          |
//! |--------|----------------------------------------|
//! | `run`  | default run, `--dry-run`               |
//! | `list` | `--list`                               |

pub mod list;
pub mod run;

use super::Cli;
use rollout::config::CliOverrides;

pub(crate) fn overrides(cli: &Cli) -> CliOverrides {
    CliOverrides {
        yes: cli.yes,
        verbose: cli.verbose,
        only: cli.only.clone(),
        from: cli.from.clone(),
    }
}
