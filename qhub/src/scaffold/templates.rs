//! Project templates.
//!
//! Each template contributes starter files under `src/` and `tests/`.
//! `{{name}}` and `{{sdk}}` are replaced when the files are written.

/// A starter file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateFile {
    /// Path relative to the project root.
    pub path: &'static str,
    /// Content with placeholders.
    pub content: &'static str,
}

/// A project template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectTemplate {
    /// Template id.
    pub id: &'static str,
    /// Short description.
    pub description: &'static str,
    /// Starter files.
    pub files: &'static [TemplateFile],
}

const BELL_QASM: &str = "\
// {{name}}: Bell state
OPENQASM 2.0;
include \"qelib1.inc\";
qreg q[2];
creg c[2];
h q[0];
cx q[0], q[1];
measure q -> c;
";

const CIRCUIT_MAIN: &str = "\
\"\"\"{{name}}: circuit project ({{sdk}}).\"\"\"

from pathlib import Path


def load_circuit() -> str:
    return (Path(__file__).parent / \"main.qasm\").read_text()


if __name__ == \"__main__\":
    print(load_circuit())
";

const CIRCUIT_TEST: &str = "\
from src.main import load_circuit


def test_circuit_has_measurement():
    assert \"measure\" in load_circuit()
";

const ALGORITHM_MAIN: &str = "\
\"\"\"{{name}}: Grover search over a marked state ({{sdk}}).\"\"\"

MARKED = \"11\"


def oracle_qasm(marked: str = MARKED) -> str:
    flips = [f\"x q[{i}];\" for i, bit in enumerate(marked) if bit == \"0\"]
    return \"\\n\".join(flips + [\"cz q[0], q[1];\"] + flips)
";

const ALGORITHM_TEST: &str = "\
from src.main import oracle_qasm


def test_oracle_for_all_ones_has_no_flips():
    assert oracle_qasm(\"11\") == \"cz q[0], q[1];\"
";

const MODEL_MAIN: &str = "\
\"\"\"{{name}}: variational quantum classifier ({{sdk}}).\"\"\"

N_QUBITS = 2
REPS = 1


def feature_map(n_qubits: int = N_QUBITS) -> list[str]:
    return [f\"h q[{i}];\" for i in range(n_qubits)]
";

const AGENT_MAIN: &str = "\
\"\"\"{{name}}: quantum-enhanced reinforcement learning agent ({{sdk}}).\"\"\"

GRID_SIZE = 4


def actions() -> list[str]:
    return [\"up\", \"down\", \"left\", \"right\"]
";

const BASIC_MAIN: &str = "\
\"\"\"{{name}}: main module.\"\"\"


def analyze(values: list[float]) -> dict[str, float]:
    if not values:
        return {\"mean\": 0.0, \"min\": 0.0, \"max\": 0.0}
    return {\"mean\": sum(values) / len(values), \"min\": min(values), \"max\": max(values)}
";

const BASIC_TEST: &str = "\
from src.main import analyze


def test_empty():
    assert analyze([])[\"mean\"] == 0.0
";

/// Every bundled template.
pub const TEMPLATES: &[ProjectTemplate] = &[
    ProjectTemplate {
        id: "circuit",
        description: "A single quantum circuit with a Bell-state starter",
        files: &[
            TemplateFile { path: "src/main.qasm", content: BELL_QASM },
            TemplateFile { path: "src/main.py", content: CIRCUIT_MAIN },
            TemplateFile { path: "tests/test_main.py", content: CIRCUIT_TEST },
        ],
    },
    ProjectTemplate {
        id: "algorithm",
        description: "A quantum algorithm with an oracle starter",
        files: &[
            TemplateFile { path: "src/main.qasm", content: BELL_QASM },
            TemplateFile { path: "src/main.py", content: ALGORITHM_MAIN },
            TemplateFile { path: "tests/test_main.py", content: ALGORITHM_TEST },
        ],
    },
    ProjectTemplate {
        id: "quantum-model",
        description: "A quantum machine learning model",
        files: &[
            TemplateFile { path: "src/main.qasm", content: BELL_QASM },
            TemplateFile { path: "src/main.py", content: MODEL_MAIN },
        ],
    },
    ProjectTemplate {
        id: "agent",
        description: "A quantum-enhanced agent",
        files: &[TemplateFile { path: "src/main.py", content: AGENT_MAIN }],
    },
    ProjectTemplate {
        id: "basic-project",
        description: "A plain project without circuit starters",
        files: &[
            TemplateFile { path: "src/main.py", content: BASIC_MAIN },
            TemplateFile { path: "tests/test_main.py", content: BASIC_TEST },
        ],
    },
];

/// Looks up a template by id.
#[must_use]
pub fn find_template(id: &str) -> Option<&'static ProjectTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

/// Ids of every bundled template.
#[must_use]
pub fn template_ids() -> Vec<String> {
    TEMPLATES.iter().map(|t| t.id.to_string()).collect()
}

/// Replaces placeholders in template content.
#[must_use]
pub fn render(content: &str, name: &str, sdk: &str) -> String {
    content.replace("{{name}}", name).replace("{{sdk}}", sdk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(find_template("circuit").unwrap().id, "circuit");
        assert!(find_template("nope").is_none());
        assert_eq!(template_ids().len(), 5);
    }

    #[test]
    fn test_render() {
        assert_eq!(
            render("{{name}} uses {{sdk}}", "Bell", "qiskit"),
            "Bell uses qiskit"
        );
    }

    #[test]
    fn test_files_live_under_src_or_tests() {
        for template in TEMPLATES {
            for file in template.files {
                assert!(
                    file.path.starts_with("src/") || file.path.starts_with("tests/"),
                    "{}: {}",
                    template.id,
                    file.path
                );
            }
        }
    }
}
