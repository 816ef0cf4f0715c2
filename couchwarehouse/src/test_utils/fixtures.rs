use serde_json::{Value, json};

/// Name of the field the mixed fixture is split by.
pub const SPLIT_FIELD: &str = "type";

pub const PRODUCT_COUNT: usize = 20;
pub const ORDER_COUNT: usize = 200;
pub const USER_COUNT: usize = 10;

/// A person document with nested objects and an array.
pub fn person(id: &str) -> Value {
    json!({
        "_id": id,
        "_rev": "1-a27e3ab0",
        "name": "Jina Pulley",
        "age": 53,
        "verified": true,
        "address": {
            "street": "6746 Barrack Lane",
            "location": {"long": -2.4, "lat": 52.8}
        },
        "tags": ["sweden", "bumper"]
    })
}

pub fn product(n: usize) -> Value {
    json!({
        "_id": format!("product{n:03}"),
        "type": "product",
        "name": format!("Product {n}"),
        "price": 9.5 + n as f64,
        "stock": {"warehouse": "north", "count": n * 3}
    })
}

pub fn order(n: usize) -> Value {
    json!({
        "_id": format!("order{n:04}"),
        "type": "order",
        "product": format!("product{:03}", n % PRODUCT_COUNT),
        "user": format!("user{:02}", n % USER_COUNT),
        "quantity": 1 + n % 4,
        "paid": n % 3 != 0
    })
}

pub fn user(n: usize) -> Value {
    json!({
        "_id": format!("user{n:02}"),
        "type": "user",
        "name": format!("User {n}"),
        "email": format!("user{n}@example.com"),
        "verified": n % 2 == 0
    })
}

/// Returns the 230 documents of the mixed fixture, with the three types interleaved.
///
/// Every eleventh document is a product or a user until those run out; orders fill the rest.
pub fn mixed_documents() -> Vec<Value> {
    let total = PRODUCT_COUNT + ORDER_COUNT + USER_COUNT;
    let (mut products, mut orders, mut users) = (0, 0, 0);
    let mut documents = Vec::with_capacity(total);

    for i in 0..total {
        let document = if i % 11 == 0 && products < PRODUCT_COUNT {
            products += 1;
            product(products)
        } else if i % 11 == 5 && users < USER_COUNT {
            users += 1;
            user(users)
        } else if orders < ORDER_COUNT {
            orders += 1;
            order(orders)
        } else if products < PRODUCT_COUNT {
            products += 1;
            product(products)
        } else {
            users += 1;
            user(users)
        };
        documents.push(document);
    }

    documents
}
