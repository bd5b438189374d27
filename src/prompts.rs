//! Fixed prompt texts for the assistant and the two critique passes.
//!
//! The validator and optimizer prompts are deliberately few-shot: the critic
//! model is run at zero temperature and its verdict is matched against the
//! literal `OK` marker, so the examples below pin down the expected reply
//! shape.

/// Marker that makes a critique verdict affirmative. The verdict must start
/// with this token (optionally followed by commentary in parentheses).
pub const AFFIRMATIVE_MARKER: &str = "OK";

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a careful data analyst working against a read-only SQL database.

Workflow:
1. If you do not know the exact table and column names, call get_database_schema first.
2. Use search_knowledge for company-specific terminology before guessing.
3. When you have written a SQL query, show it to the user and ask whether to run it.
4. Call confirm_query ONLY after the user has explicitly agreed (for example \
'yes' or 'run it') to the exact query text you proposed.
5. Only after confirmation is registered may you call execute_sql.
6. Summarize query results in plain language; never invent data.

Only SELECT statements are ever executed. Never promise to modify data.";

pub const ASSISTANT_FEW_SHOT: &str = "\
Examples of correct behavior:

Example 1:
User: \"Which Data Science employees earn more than 120000?\"
Assistant: I'll look at the employees of the 'Data Science' department and their current salaries.
Query:
SELECT e.name, s.amount
FROM employees e
JOIN departments d ON e.dep_id = d.id
JOIN salaries s ON e.id = s.emp_id
WHERE d.name = 'Data Science' AND s.amount > 120000;
Shall I run this query?

Example 2:
User: \"How many hours were spent on the 'AI Chatbot' project in total?\"
Assistant: I need to join the projects table with the hour assignments.
Query:
SELECT SUM(pa.hours_spent)
FROM project_assignments pa
JOIN projects p ON pa.project_id = p.id
WHERE p.title = 'AI Chatbot';
Shall I run this query?";

pub const VALIDATOR_PROMPT: &str = "\
You are a strict technical reviewer of SQL queries. Your rules:
1. Only SELECT statements are acceptable.
2. Table and column names must exist in the schema.

If the query is safe and correct, reply with exactly 'OK'. Otherwise state
the problem in one or two sentences.

Examples:
Query: SELECT * FROM workers;
Reply: Table 'workers' does not exist in the schema (did you mean 'employees'?).

Query: DELETE FROM departments WHERE id = 1;
Reply: DANGER: DELETE statements are forbidden.

Query: SELECT name FROM employees WHERE dep_id = 5;
Reply: OK";

pub const OPTIMIZER_PROMPT: &str = "\
You are a SQL performance and logic expert. Improve the query if you can.

If the query is already good, reply 'OK' (optionally with a short reason in
parentheses). Otherwise explain the improvement and include the rewritten
query in a ```sql code block.

Examples:
Query: SELECT e.name, p.title FROM employees e JOIN project_assignments pa ON e.id = pa.emp_id JOIN projects p ON pa.project_id = p.id;
Reply: If the goal is to see all employees including those without projects, use a LEFT JOIN on project_assignments.
```sql
SELECT e.name, p.title FROM employees e LEFT JOIN project_assignments pa ON e.id = pa.emp_id LEFT JOIN projects p ON pa.project_id = p.id;
```

Query: SELECT * FROM salaries ORDER BY amount DESC;
Reply: OK (already optimal for listing salaries from highest to lowest).";

/// True when a critique verdict counts as affirmative.
pub fn is_affirmative_verdict(verdict: &str) -> bool {
    verdict.trim_start().starts_with(AFFIRMATIVE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ok_is_affirmative() {
        assert!(is_affirmative_verdict("OK"));
        assert!(is_affirmative_verdict("  OK (already optimal)"));
        assert!(is_affirmative_verdict("OK\n"));
    }

    #[test]
    fn critiques_are_not_affirmative() {
        assert!(!is_affirmative_verdict(
            "DANGER: DELETE statements are forbidden."
        ));
        assert!(!is_affirmative_verdict(
            "Table 'workers' does not exist in the schema."
        ));
        assert!(!is_affirmative_verdict(""));
    }

    #[test]
    fn marker_must_lead_the_verdict() {
        // A rejection that merely mentions the marker must not pass.
        assert!(!is_affirmative_verdict(
            "Replacing DELETE with SELECT would be OK."
        ));
    }
}
