//! End-to-end translation fixtures: raw SQL in, full plan out.
//!
//! Filter entries, projection entries and pipeline stages are asserted
//! positionally; document order is part of the contract.

use bson::{doc, Bson};
use squill::{csuuid, Error, Operation, QueryPlan, Statement};

const UUID: &str = "695FF995-5DC4-4FBE-B80C-2621360D578F";

fn build(sql: &str) -> (QueryPlan, Option<Error>) {
    let mut plan = QueryPlan::new();
    let error = Statement::new(sql).build(&mut plan).err();
    (plan, error)
}

fn build_ok(sql: &str) -> QueryPlan {
    let (plan, error) = build(sql);
    if let Some(error) = error {
        panic!("{sql}: {error}");
    }
    plan
}

#[test]
fn syntax_errors_pass_through() {
    let (_, error) = build("SQL (MYSQL DIALECT) TO MONGO WITH OPTIMIZER, LET'S GO!");
    let error = error.expect("parse error");
    assert!(matches!(error, Error::Parse(_)));
    assert!(error.to_string().contains("Expected"), "{error}");
}

#[test]
fn select_star_is_a_plain_find() {
    let plan = build_ok("SELECT * FROM users");
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "users");
    assert!(plan.filter.is_empty());
    assert!(plan.projection.is_none());
    assert!(plan.pipeline.is_empty());
}

#[test]
fn uuid_stays_a_string_for_string_id_collections() {
    let plan = build_ok(&format!("select * from user where _id = '{UUID}'"));
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "user");
    assert_eq!(plan.filter, doc! {"_id": UUID});
}

#[test]
fn uuid_becomes_legacy_binary_for_binary_id_collections() {
    let plan = build_ok(&format!("select * from User where _id = '{UUID}'"));
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "User");
    assert_eq!(plan.filter, doc! {"_id": csuuid(UUID).unwrap()});
}

#[test]
fn uuid_against_non_id_field_stays_a_string() {
    let plan = build_ok(&format!("SELECT * FROM User WHERE notes = '{UUID}'"));
    assert_eq!(plan.filter, doc! {"notes": UUID});
}

#[test]
fn single_column_projection() {
    let plan = build_ok(&format!(
        "SELECT first_name FROM user_profile WHERE _id = '{UUID}'"
    ));
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "user_profile");
    assert_eq!(plan.projection, Some(doc! {"first_name": 1}));
    assert_eq!(plan.filter, doc! {"_id": UUID});
}

#[test]
fn limit_and_offset_stay_flat() {
    let plan = build_ok(&format!(
        "SELECT * FROM fanchecks WHERE _id = '{UUID}' LIMIT 10 OFFSET 2"
    ));
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.filter, doc! {"_id": UUID});
    assert_eq!(plan.limit, Some(10));
    assert_eq!(plan.offset, Some(2));
}

#[test]
fn mysql_comma_limit_promotes_to_findone() {
    let plan = build_ok("SELECT a.uuid FROM answers a LIMIT 13, 1");
    assert_eq!(plan.operation, Some(Operation::FindOne));
    assert_eq!(plan.collection, "answers");
    assert_eq!(plan.projection, Some(doc! {"uuid": 1}));
    assert_eq!(plan.limit, Some(1));
    assert_eq!(plan.offset, Some(13));
}

#[test]
fn limit_one_promotes_to_findone() {
    let plan = build_ok("SELECT * FROM fanchecks LIMIT 1");
    assert_eq!(plan.operation, Some(Operation::FindOne));
    assert_eq!(plan.collection, "fanchecks");
    assert_eq!(plan.limit, Some(1));
    assert!(plan.pipeline.is_empty());
}

#[test]
fn limit_zero_stays_find() {
    let plan = build_ok("SELECT * FROM fanchecks LIMIT 0");
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.limit, Some(0));
}

#[test]
fn bare_count_star_is_a_count() {
    let plan = build_ok("SELECT COUNT(q.*) FROM questions AS q");
    assert_eq!(plan.operation, Some(Operation::Count));
    assert_eq!(plan.collection, "questions");
    assert!(plan.pipeline.is_empty());
}

#[test]
fn distinct_function_sets_distinct_operation() {
    let plan = build_ok("SELECT DISTINCT(theme) FROM questions WHERE theme != ''");
    assert_eq!(plan.operation, Some(Operation::Distinct));
    assert_eq!(plan.collection, "questions");
    assert_eq!(plan.projection, Some(doc! {"theme": 1}));
    assert_eq!(plan.filter, doc! {"theme": {"$ne": ""}});
    assert!(plan.pipeline.is_empty());
}

#[test]
fn distinct_keyword_sets_distinct_operation() {
    let plan = build_ok("SELECT DISTINCT theme FROM questions");
    assert_eq!(plan.operation, Some(Operation::Distinct));
    assert_eq!(plan.projection, Some(doc! {"theme": 1}));
}

#[test]
fn array_contains_coerces_and_clears_projection() {
    let plan = build_ok(&format!(
        "SELECT * FROM User WHERE ARRAY_CONTAINS(Accounts, '{UUID}')"
    ));
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "User");
    assert_eq!(
        plan.filter,
        doc! {"Accounts": {"$in": [csuuid(UUID).unwrap()]}}
    );
    assert!(plan.projection.is_none());
}

#[test]
fn array_contains_on_a_non_id_field_stays_a_string() {
    let plan = build_ok(&format!(
        "SELECT * FROM User WHERE ARRAY_CONTAINS(tags, '{UUID}')"
    ));
    assert_eq!(plan.filter, doc! {"tags": {"$in": [UUID]}});
}

#[test]
fn plain_equality_filter() {
    let plan = build_ok("SELECT * FROM questions WHERE theme = 'Erkenning & Waardering'");
    assert_eq!(plan.filter, doc! {"theme": "Erkenning & Waardering"});
}

#[test]
fn quoted_table_names_unwrap() {
    let plan = build_ok("SELECT GroupName FROM `Group`");
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(plan.collection, "Group");
    assert_eq!(plan.projection, Some(doc! {"GroupName": 1}));
}

#[test]
fn dotted_fields_pass_through() {
    let plan = build_ok("SELECT * FROM questions WHERE theme.nl = 'Some Theme'");
    assert_eq!(plan.filter, doc! {"theme.nl": "Some Theme"});
}

#[test]
fn join_builds_lookup_unwind_match_project() {
    let plan = build_ok(
        "SELECT u.name, p.city FROM users u JOIN profiles p ON u.id = p.user_id WHERE u.age > 25",
    );
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(plan.collection, "users");
    assert!(plan.filter.is_empty());
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "profiles",
                "localField": "id",
                "foreignField": "user_id",
                "as": "profiles",
            }},
            doc! {"$unwind": "$profiles"},
            doc! {"$match": {"age": {"$gt": 25}}},
            doc! {"$project": {"name": 1, "city": "$profiles.city"}},
        ]
    );
}

#[test]
fn left_join_preserves_empty_matches() {
    let plan = build_ok(
        "SELECT u.name, d.name as dept_name FROM users u LEFT JOIN departments d ON u.dept_id = d.id",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "departments",
                "localField": "dept_id",
                "foreignField": "id",
                "as": "departments",
            }},
            doc! {"$unwind": {"path": "$departments", "preserveNullAndEmptyArrays": true}},
            doc! {"$project": {"name": 1, "dept_name": "$departments.name"}},
        ]
    );
}

#[test]
fn multiple_joins_compose_in_source_order() {
    let plan = build_ok(
        "SELECT u.name as user_name, d.name as dept_name, p.title as project_title \
         FROM users u \
         JOIN departments d ON u.dept_id = d.id \
         JOIN projects p ON u.id = p.user_id",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "departments",
                "localField": "dept_id",
                "foreignField": "id",
                "as": "departments",
            }},
            doc! {"$unwind": "$departments"},
            doc! {"$lookup": {
                "from": "projects",
                "localField": "id",
                "foreignField": "user_id",
                "as": "projects",
            }},
            doc! {"$unwind": "$projects"},
            doc! {"$project": {
                "user_name": "$name",
                "dept_name": "$departments.name",
                "project_title": "$projects.title",
            }},
        ]
    );
}

#[test]
fn join_with_filters_and_sort_follows_canonical_order() {
    let plan = build_ok(
        "SELECT p.name, c.name AS category_name \
         FROM products p INNER JOIN categories c ON p.category_id = c.id \
         WHERE p.price > 100 AND c.name IN ('Electronics', 'Books') \
         ORDER BY p.price DESC",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "categories",
                "localField": "category_id",
                "foreignField": "id",
                "as": "categories",
            }},
            doc! {"$unwind": "$categories"},
            doc! {"$match": {
                "price": {"$gt": 100},
                "categories.name": {"$in": ["Electronics", "Books"]},
            }},
            doc! {"$project": {"name": 1, "category_name": "$categories.name"}},
            doc! {"$sort": {"price": -1}},
        ]
    );
}

#[test]
fn group_by_having_follows_canonical_order() {
    let plan = build_ok(
        "SELECT department, AVG(salary) AS avg_salary FROM employees \
         WHERE hire_date >= '2020-01-01' GROUP BY department \
         HAVING AVG(salary) > 50000",
    );
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(plan.collection, "employees");
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$match": {"hire_date": {"$gte": "2020-01-01"}}},
            doc! {"$group": {
                "_id": "$department",
                "department": {"$first": "$department"},
                "avg_salary": {"$avg": "$salary"},
            }},
            doc! {"$match": {"avg_salary": {"$gt": 50000}}},
        ]
    );
}

#[test]
fn having_matches_select_alias_through_the_derived_name() {
    let plan = build_ok(
        "SELECT u.name, COUNT(o.id) AS order_count FROM users u \
         LEFT JOIN orders o ON u.id = o.user_id \
         WHERE u.age > 25 GROUP BY u.id \
         HAVING COUNT(o.id) > 5 ORDER BY order_count DESC LIMIT 10",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "orders",
                "localField": "id",
                "foreignField": "user_id",
                "as": "orders",
            }},
            doc! {"$unwind": {"path": "$orders", "preserveNullAndEmptyArrays": true}},
            doc! {"$match": {"age": {"$gt": 25}}},
            doc! {"$group": {
                "_id": "$id",
                "id": {"$first": "$id"},
                "order_count": {"$sum": {"$cond": [{"$ne": ["$orders.id", Bson::Null]}, 1, 0]}},
            }},
            doc! {"$match": {"order_count": {"$gt": 5}}},
            doc! {"$sort": {"order_count": -1}},
            doc! {"$limit": 10_i64},
        ]
    );
}

#[test]
fn having_on_a_bare_alias() {
    let plan = build_ok(
        "SELECT category, AVG(price) as avg_price FROM products \
         GROUP BY category HAVING avg_price > 100",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$group": {
                "_id": "$category",
                "category": {"$first": "$category"},
                "avg_price": {"$avg": "$price"},
            }},
            doc! {"$match": {"avg_price": {"$gt": 100}}},
        ]
    );
}

#[test]
fn group_by_with_sort_on_the_aggregate() {
    let plan = build_ok(
        "SELECT department, COUNT(*) as emp_count FROM employees \
         GROUP BY department ORDER BY emp_count DESC",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$group": {
                "_id": "$department",
                "department": {"$first": "$department"},
                "emp_count": {"$sum": 1},
            }},
            doc! {"$sort": {"emp_count": -1}},
        ]
    );
}

#[test]
fn multiple_aggregates_share_one_group_stage() {
    let plan = build_ok(
        "SELECT COUNT(*) as count, SUM(price) as total, AVG(price) as avg, \
         MIN(price) as min, MAX(price) as max FROM products",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$group": {
            "_id": Bson::Null,
            "count": {"$sum": 1},
            "total": {"$sum": "$price"},
            "avg": {"$avg": "$price"},
            "min": {"$min": "$price"},
            "max": {"$max": "$price"},
        }}]
    );
}

#[test]
fn aliased_count_star_is_an_aggregate() {
    let plan = build_ok("SELECT COUNT(*) as total FROM users");
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$group": {"_id": Bson::Null, "total": {"$sum": 1}}}]
    );
}

#[test]
fn count_distinct_collects_a_set_and_projects_its_size() {
    let plan = build_ok("SELECT COUNT(DISTINCT user_id) as unique_users FROM events");
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$group": {"_id": Bson::Null, "unique_users": {"$addToSet": "$user_id"}}},
            doc! {"$project": {"unique_users": {"$size": "$unique_users"}}},
        ]
    );
}

#[test]
fn count_distinct_alongside_other_aggregates() {
    let plan = build_ok(
        "SELECT COUNT(DISTINCT user_id) as unique_users, AVG(amount) as avg_amount \
         FROM orders WHERE status IN ('completed', 'shipped')",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$match": {"status": {"$in": ["completed", "shipped"]}}},
            doc! {"$group": {
                "_id": Bson::Null,
                "unique_users": {"$addToSet": "$user_id"},
                "avg_amount": {"$avg": "$amount"},
            }},
            doc! {"$project": {
                "unique_users": {"$size": "$unique_users"},
                "avg_amount": 1,
            }},
        ]
    );
}

#[test]
fn count_distinct_with_group_keys_carries_grouped_fields() {
    let plan = build_ok(
        "SELECT department, SUM(salary) as total_salary, \
         COUNT(DISTINCT employee_id) as emp_count \
         FROM payroll GROUP BY department HAVING total_salary > 1000000",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$group": {
                "_id": "$department",
                "department": {"$first": "$department"},
                "total_salary": {"$sum": "$salary"},
                "emp_count": {"$addToSet": "$employee_id"},
            }},
            doc! {"$match": {"total_salary": {"$gt": 1000000}}},
            doc! {"$project": {
                "department": 1,
                "total_salary": 1,
                "emp_count": {"$size": "$emp_count"},
            }},
        ]
    );
}

#[test]
fn searched_case_projects_a_cond() {
    let plan =
        build_ok("SELECT CASE WHEN age > 18 THEN 'adult' ELSE 'minor' END AS age_group FROM users");
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {"age_group": {"$cond": {
            "if": {"$gt": ["$age", 18]},
            "then": "adult",
            "else": "minor",
        }}}}]
    );
}

#[test]
fn simple_case_rewrites_to_searched_case() {
    let plan = build_ok(
        "SELECT name, CASE category WHEN 'electronics' THEN price * 0.9 \
         WHEN 'books' THEN price * 0.95 ELSE price END AS discounted_price FROM products",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {
            "name": 1,
            "discounted_price": {"$cond": {
                "if": {"$eq": ["$category", "electronics"]},
                "then": {"$multiply": ["$price", 0.9]},
                "else": {"$cond": {
                    "if": {"$eq": ["$category", "books"]},
                    "then": {"$multiply": ["$price", 0.95]},
                    "else": "$price",
                }},
            }},
        }}]
    );
}

#[test]
fn case_without_else_falls_back_to_a_null_literal() {
    let plan =
        build_ok("SELECT CASE WHEN vip = 1 THEN 'gold' END AS tier FROM customers");
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {"tier": {"$cond": {
            "if": {"$eq": ["$vip", 1]},
            "then": "gold",
            "else": {"$literal": Bson::Null},
        }}}}]
    );
}

#[test]
fn aggregate_over_a_case_expression() {
    let plan = build_ok(
        "SELECT department, SUM(CASE WHEN status = 'active' THEN salary ELSE 0 END) as active_salary \
         FROM employees GROUP BY department",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$group": {
            "_id": "$department",
            "department": {"$first": "$department"},
            "active_salary": {"$sum": {"$cond": {
                "if": {"$eq": ["$status", "active"]},
                "then": "$salary",
                "else": 0,
            }}},
        }}]
    );
}

#[test]
fn boolean_expression_in_select_forces_aggregate() {
    let plan = build_ok(
        "SELECT name, (price > 100 AND stock > 0) as in_stock_expensive FROM products",
    );
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {
            "name": 1,
            "in_stock_expensive": {"$and": [
                {"$gt": ["$price", 100]},
                {"$gt": ["$stock", 0]},
            ]},
        }}]
    );
}

#[test]
fn like_or_and_between_keep_source_order() {
    let plan = build_ok(
        "SELECT * FROM products WHERE name LIKE '%phone%' \
         AND (category = 'Electronics' OR category = 'Accessories') \
         AND price BETWEEN 100 AND 500",
    );
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(
        plan.filter,
        doc! {
            "name": {"$regex": ".*phone.*", "$options": "i"},
            "$or": [
                {"category": "Electronics"},
                {"category": "Accessories"},
            ],
            "price": {"$gte": 100, "$lte": 500},
        }
    );
}

#[test]
fn top_level_or_collapses_to_one_entry() {
    let plan = build_ok(
        "SELECT name, description FROM products \
         WHERE name LIKE '%phone%' OR description LIKE '%mobile%'",
    );
    assert_eq!(plan.operation, Some(Operation::Find));
    assert_eq!(
        plan.filter,
        doc! {"$or": [
            {"name": {"$regex": ".*phone.*", "$options": "i"}},
            {"description": {"$regex": ".*mobile.*", "$options": "i"}},
        ]}
    );
}

#[test]
fn between_strings_and_a_parenthesised_or() {
    let plan = build_ok(
        "SELECT * FROM orders WHERE created_at BETWEEN '2023-01-01' AND '2023-12-31' \
         AND (status = 'pending' OR status = 'processing')",
    );
    assert_eq!(
        plan.filter,
        doc! {
            "created_at": {"$gte": "2023-01-01", "$lte": "2023-12-31"},
            "$or": [
                {"status": "pending"},
                {"status": "processing"},
            ],
        }
    );
}

#[test]
fn conjuncts_append_in_source_order() {
    let plan = build_ok(
        "SELECT * FROM products WHERE price > 100 AND quantity <= 50 \
         AND category != 'books' AND supplier IN ('A', 'B') \
         AND status NOT IN ('discontinued')",
    );
    assert_eq!(
        plan.filter,
        doc! {
            "price": {"$gt": 100},
            "quantity": {"$lte": 50},
            "category": {"$ne": "books"},
            "supplier": {"$in": ["A", "B"]},
            "status": {"$nin": ["discontinued"]},
        }
    );
}

#[test]
fn repeated_fields_merge_their_operators() {
    let plan = build_ok("SELECT * FROM products WHERE price > 10 AND price < 100");
    assert_eq!(plan.filter, doc! {"price": {"$gt": 10, "$lt": 100}});
}

#[test]
fn equality_after_an_operator_folds_in_as_eq() {
    let plan = build_ok("SELECT * FROM products WHERE price > 10 AND price = 50");
    assert_eq!(plan.filter, doc! {"price": {"$gt": 10, "$eq": 50}});
}

#[test]
fn equality_before_an_operator_folds_in_as_eq() {
    let plan = build_ok("SELECT * FROM products WHERE price = 50 AND price > 10");
    assert_eq!(plan.filter, doc! {"price": {"$eq": 50, "$gt": 10}});
}

#[test]
fn null_tests_lower_to_null_filters() {
    let plan = build_ok(
        "SELECT * FROM users WHERE deleted_at IS NULL AND email IS NOT NULL",
    );
    assert_eq!(
        plan.filter,
        doc! {"deleted_at": Bson::Null, "email": {"$ne": Bson::Null}}
    );
}

#[test]
fn unknown_functions_error_but_keep_the_partial_plan() {
    let (plan, error) = build("SELECT UNKNOWN_FUNC(user_id) as bad_func FROM users");
    let error = error.expect("translation error");
    assert_eq!(error.to_string(), "unhandled function: UNKNOWN_FUNC");
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert_eq!(plan.collection, "users");
    assert!(plan.pipeline.is_empty());
}

#[test]
fn string_functions_project_computed_fields() {
    let plan = build_ok(
        "SELECT CONCAT(first_name, ' ', last_name) as full_name, \
         UPPER(email) as email_upper FROM users WHERE LOWER(status) = 'active'",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$match": {"status": {"$regex": "^active$", "$options": "i"}}},
            doc! {"$project": {
                "full_name": {"$concat": ["$first_name", " ", "$last_name"]},
                "email_upper": {"$toUpper": "$email"},
            }},
        ]
    );
}

#[test]
fn coalesce_and_ifnull_map_to_ifnull() {
    let plan = build_ok(
        "SELECT name, COALESCE(description, 'No description available') as description_text, \
         IFNULL(price, 0) as price FROM products",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {
            "name": 1,
            "description_text": {"$ifNull": ["$description", "No description available"]},
            "price": {"$ifNull": ["$price", 0]},
        }}]
    );
}

#[test]
fn substring_and_length_map_to_string_operators() {
    let plan = build_ok(
        "SELECT SUBSTRING(name, 1, 3) as name_prefix, LENGTH(description) as desc_length \
         FROM products",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {
            "name_prefix": {"$substr": ["$name", 0, 3]},
            "desc_length": {"$strLenCP": "$description"},
        }}]
    );
}

#[test]
fn locate_swaps_its_arguments_for_index_of() {
    let plan = build_ok(
        "SELECT LOCATE('sale', LOWER(description)) as has_sale FROM products",
    );
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$project": {
            "has_sale": {"$indexOfCP": [{"$toLower": "$description"}, "sale"]},
        }}]
    );
}

#[test]
fn date_format_group_key_projects_the_group_id() {
    let plan = build_ok(
        "SELECT DATE_FORMAT(created_at, '%Y-%m-%d') as date, COUNT(*) as count \
         FROM orders GROUP BY DATE_FORMAT(created_at, '%Y-%m-%d')",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$group": {
                "_id": {"$dateToString": {"format": "%Y-%m-%d", "date": "$created_at"}},
                "count": {"$sum": 1},
            }},
            doc! {"$project": {"date": "$_id", "count": 1, "_id": 0}},
        ]
    );
}

#[test]
fn correlated_count_subquery_becomes_lookup_and_add_fields() {
    let plan = build_ok(
        "SELECT u.name, (SELECT COUNT(*) FROM orders o WHERE o.user_id = u.id) AS order_count \
         FROM users u WHERE u.status = 'active'",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "orders",
                "localField": "id",
                "foreignField": "user_id",
                "as": "subquery_result",
            }},
            doc! {"$addFields": {"order_count": {"$size": "$subquery_result"}}},
            doc! {"$match": {"status": "active"}},
            doc! {"$project": {"name": 1, "order_count": 1}},
        ]
    );
}

#[test]
fn join_on_subquery_uses_a_let_pipeline_lookup() {
    let plan = build_ok(
        "SELECT u.name as user_name, d.name as dept_name FROM users u \
         JOIN departments d ON d.id = ( \
             SELECT dept_id FROM user_departments ud \
             WHERE ud.user_id = u.id ORDER BY ud.start_date DESC LIMIT 1)",
    );
    assert_eq!(
        plan.pipeline,
        vec![
            doc! {"$lookup": {
                "from": "user_departments",
                "let": {"user_id": "$id"},
                "pipeline": [
                    {"$match": {"$expr": {"$eq": ["$user_id", "$$user_id"]}}},
                    {"$sort": {"start_date": -1}},
                    {"$limit": 1_i64},
                    {"$project": {"dept_id": 1}},
                ],
                "as": "departments",
            }},
            doc! {"$unwind": "$departments"},
            doc! {"$project": {"user_name": "$name", "dept_name": "$departments.name"}},
        ]
    );
}

#[test]
fn order_by_alone_folds_into_a_sort_stage() {
    let plan = build_ok("SELECT * FROM users ORDER BY age DESC, name");
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert!(plan.sort.is_empty());
    assert_eq!(
        plan.pipeline,
        vec![doc! {"$sort": {"age": -1, "name": 1}}]
    );
}

#[test]
fn aggregate_plans_keep_flat_fields_empty() {
    let plan = build_ok(
        "SELECT department, AVG(salary) AS avg_salary FROM employees \
         GROUP BY department ORDER BY avg_salary DESC LIMIT 5",
    );
    assert_eq!(plan.operation, Some(Operation::Aggregate));
    assert!(plan.filter.is_empty());
    assert!(plan.sort.is_empty());
    assert_eq!(plan.limit, None);
    assert_eq!(plan.offset, None);
    let keys: Vec<&str> = plan
        .pipeline
        .iter()
        .flat_map(|stage| stage.keys().map(String::as_str))
        .collect();
    assert_eq!(keys, vec!["$group", "$sort", "$limit"]);
}

#[test]
fn building_twice_is_deterministic() {
    let sql = "SELECT department, AVG(salary) AS avg_salary FROM employees \
               WHERE hire_date >= '2020-01-01' GROUP BY department \
               HAVING AVG(salary) > 50000";
    assert_eq!(build_ok(sql), build_ok(sql));
}

#[test]
fn non_select_statements_are_rejected() {
    let (_, error) = build("DELETE FROM users");
    assert!(matches!(error, Some(Error::Unsupported(_))));
}
